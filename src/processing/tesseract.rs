use log::{debug, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::TesseractConfig;
use crate::models::OcrResult;
use crate::processing::image::NormalizedImage;
use crate::processing::ocr::{RecognitionRequest, Recognizer, Region};
use crate::utils::{ExtractError, Result};

const BACKEND: &str = "local";
const MRZ_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789<";
const INSTALL_HINT: &str = "install tesseract-ocr or set [tesseract] path in the configuration";

/// Local tesseract engine. Runs the executable by default, or the linked
/// library when built with the `libtesseract` feature.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    #[cfg_attr(feature = "libtesseract", allow(dead_code))]
    executable: Option<PathBuf>,
    #[cfg_attr(not(feature = "libtesseract"), allow(dead_code))]
    datapath: Option<PathBuf>,
    installed: Vec<String>,
}

impl TesseractEngine {
    pub fn new(config: &TesseractConfig) -> Result<Self> {
        let executable = match &config.path {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(path) => {
                warn!(
                    "configured tesseract {} does not exist, searching PATH",
                    path.display()
                );
                find_on_path("tesseract")
            }
            None => find_on_path("tesseract"),
        };

        if executable.is_none() && !cfg!(feature = "libtesseract") {
            let reason = match &config.path {
                Some(path) => format!(
                    "tesseract executable {} does not exist and none was found on PATH",
                    path.display()
                ),
                None => "tesseract executable not found on PATH".to_string(),
            };
            return Err(ExtractError::engine_unavailable(BACKEND, reason, INSTALL_HINT));
        }

        let installed = executable
            .as_deref()
            .map(list_languages)
            .unwrap_or_default();
        debug!("tesseract languages installed: {:?}", installed);

        Ok(TesseractEngine {
            executable,
            datapath: config.datapath.clone(),
            installed,
        })
    }

    pub fn installed_languages(&self) -> &[String] {
        &self.installed
    }

    #[cfg_attr(feature = "libtesseract", allow(dead_code))]
    fn run_executable(&self, executable: &Path, image: &NormalizedImage, languages: &str, region: Region) -> Result<String> {
        let mut temp_file = tempfile::Builder::new().suffix(".jpg").tempfile()?;
        temp_file.write_all(image.jpeg())?;
        temp_file.flush()?;

        let mut command = Command::new(executable);
        command.arg(temp_file.path()).arg("stdout").arg("-l").arg(languages);
        if region == Region::Mrz {
            command
                .arg("--psm")
                .arg("6")
                .arg("-c")
                .arg(format!("tessedit_char_whitelist={}", MRZ_WHITELIST));
        }

        let output = command.output().map_err(|e| {
            ExtractError::engine_unavailable(BACKEND, format!("failed to run tesseract: {}", e), INSTALL_HINT)
        })?;

        if !output.status.success() {
            return Err(ExtractError::engine_unavailable(
                BACKEND,
                format!(
                    "tesseract exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                "check that the requested language data is installed",
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(feature = "libtesseract")]
    fn run_library(&self, image: &NormalizedImage, languages: &str, region: Region) -> Result<(String, Option<f32>)> {
        use tesseract::Tesseract;

        let unavailable = |e: &dyn std::fmt::Display| {
            ExtractError::engine_unavailable(BACKEND, e.to_string(), "check TESSDATA_PREFIX or [tesseract] datapath")
        };
        let datapath = self.datapath.as_deref().and_then(Path::to_str);

        let mut tess = Tesseract::new(datapath, Some(languages))
            .map_err(|e| unavailable(&e))?
            .set_image_from_mem(image.jpeg())
            .map_err(|e| unavailable(&e))?;
        if region == Region::Mrz {
            tess = tess
                .set_variable("tessedit_char_whitelist", MRZ_WHITELIST)
                .map_err(|e| unavailable(&e))?;
        }
        let mut tess = tess.recognize().map_err(|e| unavailable(&e))?;
        let confidence = tess.mean_text_conf();
        let text = tess.get_text().map_err(|e| unavailable(&e))?;
        Ok((text, Some(confidence as f32)))
    }
}

impl Recognizer for TesseractEngine {
    fn id(&self) -> &str {
        BACKEND
    }

    fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult> {
        let requested = match request.region {
            Region::Mrz => vec!["eng"],
            Region::Page => request.languages(),
        };
        let languages = resolve_languages(&requested, &self.installed);
        let joined = languages.join("+");
        debug!(
            "running tesseract on {}x{} image with languages {}",
            image.width(),
            image.height(),
            joined
        );

        #[cfg(feature = "libtesseract")]
        let (text, confidence) = self.run_library(image, &joined, request.region)?;

        #[cfg(not(feature = "libtesseract"))]
        let (text, confidence) = match &self.executable {
            Some(executable) => (self.run_executable(executable, image, &joined, request.region)?, None),
            None => {
                return Err(ExtractError::engine_unavailable(
                    BACKEND,
                    "tesseract executable not found",
                    INSTALL_HINT,
                ))
            }
        };

        let mut result = OcrResult::from_text(BACKEND, &text);
        result.languages = languages;
        result.confidence = confidence;
        if result.lines.is_empty() {
            warn!("tesseract returned no text");
        }
        Ok(result)
    }
}

/// Reduces the requested languages to the installed ones, falling back to
/// `eng` or else the first installed language. An unknown installation
/// leaves the request untouched.
pub fn resolve_languages(requested: &[&str], installed: &[String]) -> Vec<String> {
    if installed.is_empty() {
        let requested: Vec<String> = requested.iter().map(|l| l.to_string()).collect();
        return if requested.is_empty() { vec!["eng".to_string()] } else { requested };
    }

    let available: Vec<String> = requested
        .iter()
        .filter(|l| installed.iter().any(|i| i == *l))
        .map(|l| l.to_string())
        .collect();
    if !available.is_empty() {
        return available;
    }

    warn!(
        "none of the requested languages {:?} are installed, falling back",
        requested
    );
    if installed.iter().any(|l| l == "eng") {
        vec!["eng".to_string()]
    } else {
        vec![installed[0].clone()]
    }
}

/// Parses `tesseract --list-langs` output, which older releases print on stderr.
pub fn parse_language_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of") && !line.contains(' '))
        .filter(|line| *line != "osd")
        .map(str::to_string)
        .collect()
}

fn list_languages(executable: &Path) -> Vec<String> {
    match Command::new(executable).arg("--list-langs").output() {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            parse_language_list(&text)
        }
        Err(e) => {
            warn!("could not list tesseract languages: {}", e);
            Vec::new()
        }
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    find_in(&std::env::var_os("PATH")?, name)
}

fn find_in(search_path: &std::ffi::OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(langs: &[&str]) -> Vec<String> {
        langs.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn keeps_installed_subset_of_request() {
        let langs = resolve_languages(&["eng", "ind"], &installed(&["eng", "fra"]));
        assert_eq!(langs, vec!["eng"]);
    }

    #[test]
    fn falls_back_to_english_then_first_installed() {
        assert_eq!(resolve_languages(&["ind"], &installed(&["fra", "eng"])), vec!["eng"]);
        assert_eq!(resolve_languages(&["ind"], &installed(&["fra", "deu"])), vec!["fra"]);
        assert_eq!(resolve_languages(&["eng", "ind"], &[]), vec!["eng", "ind"]);
    }

    #[test]
    fn parses_list_langs_output() {
        let output = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nind\nosd\n";
        assert_eq!(parse_language_list(output), vec!["eng", "ind"]);
    }

    #[test]
    fn missing_configured_executable_falls_back_to_path() {
        let config = TesseractConfig {
            path: Some(PathBuf::from("/nonexistent/bin/tesseract")),
            datapath: None,
        };
        match (TesseractEngine::new(&config), find_on_path("tesseract")) {
            (Ok(engine), Some(found)) => assert_eq!(engine.executable, Some(found)),
            (Err(err), None) => {
                assert!(matches!(err, ExtractError::EngineUnavailable { .. }));
                assert!(err.to_string().contains("/nonexistent/bin/tesseract"));
            }
            (Ok(_), None) => assert!(cfg!(feature = "libtesseract")),
            (Err(err), Some(_)) => panic!("PATH fallback ignored: {}", err),
        }
    }

    #[test]
    fn path_lookup_finds_executable_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tesseract")).unwrap();
        assert!(find_in(dir.path().as_os_str(), "tesseract").is_none());

        let bin = tempfile::tempdir().unwrap();
        let exe = bin.path().join("tesseract");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        let joined = std::env::join_paths([dir.path(), bin.path()]).unwrap();
        assert_eq!(find_in(&joined, "tesseract"), Some(exe));
    }
}
