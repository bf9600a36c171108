use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

const CONFIG_PATH: &str = "strobe.ini";

// --- Minimal INI reader ---
#[derive(Debug, Default)]
pub struct SimpleIni {
    sections: HashMap<String, HashMap<String, String>>,
}

impl SimpleIni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        self.sections.clear();

        let mut current_section: Option<String> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            // Section header: [SectionName]
            if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
                let name = &line[1..line.len() - 1];
                let section = name.trim().to_string();
                current_section = Some(section.clone());
                self.sections.entry(section).or_default();
                continue;
            }

            // Key/value pair: key=value
            if let Some(eq_idx) = line.find('=') {
                let (key_raw, value_raw) = line.split_at(eq_idx);
                let key = key_raw.trim();
                if key.is_empty() {
                    continue;
                }
                let value = value_raw[1..].trim().to_string();
                let section = current_section.clone().unwrap_or_default();
                self.sections
                    .entry(section)
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }

        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.sections.get(section).and_then(|s| s.get(key)).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub vsync: bool,
    pub gfx_debug: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vsync: true,
            gfx_debug: false,
            window_width: 1280,
            window_height: 720,
            log_level: LogLevel::Info,
        }
    }
}

/// Reads `strobe.ini` next to the executable; missing file or malformed
/// values fall back to defaults quietly (first run has no config yet).
pub fn load() -> Config {
    let mut config = Config::default();
    let mut ini = SimpleIni::new();
    if ini.load(CONFIG_PATH).is_err() {
        info!("no {CONFIG_PATH}; using defaults");
        return config;
    }

    let mut parse = |section: &str, key: &str, apply: &mut dyn FnMut(&str) -> bool| {
        if let Some(value) = ini.get(section, key) {
            if !apply(&value) {
                warn!("ignoring malformed {section}.{key}={value}");
            }
        }
    };

    parse("Video", "VSync", &mut |v| {
        parse_bool(v).map(|b| config.vsync = b).is_some()
    });
    parse("Video", "GfxDebug", &mut |v| {
        parse_bool(v).map(|b| config.gfx_debug = b).is_some()
    });
    parse("Video", "WindowWidth", &mut |v| {
        v.parse::<u32>().map(|n| config.window_width = n.max(1)).is_ok()
    });
    parse("Video", "WindowHeight", &mut |v| {
        v.parse::<u32>().map(|n| config.window_height = n.max(1)).is_ok()
    });
    parse("Log", "Level", &mut |v| {
        v.parse::<LogLevel>().map(|l| config.log_level = l).is_ok()
    });

    config
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ini_reader_handles_sections_comments_and_whitespace() {
        let mut ini = SimpleIni::new();
        let dir = std::env::temp_dir().join("strobe_config_test.ini");
        std::fs::write(
            &dir,
            "; comment\n[Video]\nVSync = off\n  WindowWidth=1920\n\n[Log]\nLevel=debug\n",
        )
        .unwrap();
        ini.load(&dir).unwrap();
        std::fs::remove_file(&dir).ok();

        assert_eq!(ini.get("Video", "VSync").as_deref(), Some("off"));
        assert_eq!(ini.get("Video", "WindowWidth").as_deref(), Some("1920"));
        assert_eq!(ini.get("Log", "Level").as_deref(), Some("debug"));
        assert_eq!(ini.get("Video", "Missing"), None);
    }

    #[test]
    fn bool_values_accept_common_spellings() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("sideways"), None);
    }

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
