use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::engine::{EngineSettings, LoadPolicy};
use crate::provision::DEFAULT_WEIGHTS_URL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InitMode {
    /// Bind right away, load the model on the first /predict.
    Lazy,
    /// Load the model before binding; a failed download aborts startup.
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyKind {
    Strict,
    Tolerant,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    #[arg(long, env = "DOG_EMOTION_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "DOG_EMOTION_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Local weights file; downloaded from --weights-url when absent
    #[arg(long, env = "DOG_EMOTION_WEIGHTS", default_value = "dog_emotion_model.pth")]
    pub weights_path: PathBuf,

    #[arg(long, env = "DOG_EMOTION_WEIGHTS_URL", default_value = DEFAULT_WEIGHTS_URL)]
    pub weights_url: String,

    /// Directory holding the webcam page and its assets
    #[arg(long, env = "DOG_EMOTION_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    #[arg(long, env = "DOG_EMOTION_INIT", value_enum, default_value_t = InitMode::Lazy)]
    pub init: InitMode,

    #[arg(long, env = "DOG_EMOTION_LOAD_POLICY", value_enum, default_value_t = PolicyKind::Tolerant)]
    pub load_policy: PolicyKind,

    /// Largest fraction of model parameters the checkpoint may leave unset (tolerant policy)
    #[arg(long, env = "DOG_EMOTION_MAX_MISSING_RATIO", default_value_t = 0.1, value_parser = parse_ratio)]
    pub max_missing_ratio: f64,
}

fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw.parse().map_err(|e| format!("not a number: {e}"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{ratio} is outside [0, 1]"))
    }
}

impl Settings {
    pub fn load_policy(&self) -> LoadPolicy {
        match self.load_policy {
            PolicyKind::Strict => LoadPolicy::Strict,
            PolicyKind::Tolerant => LoadPolicy::Tolerant {
                max_missing_ratio: self.max_missing_ratio,
            },
        }
    }

    pub fn engine(&self) -> EngineSettings {
        EngineSettings {
            weights_path: self.weights_path.clone(),
            weights_url: self.weights_url.clone(),
            policy: self.load_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoadReport;

    #[test]
    fn defaults_match_release_layout() {
        let settings = Settings::try_parse_from(["dog-emotion-server"]).unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.init, InitMode::Lazy);
        assert_eq!(settings.weights_path, PathBuf::from("dog_emotion_model.pth"));
        assert_eq!(settings.weights_url, DEFAULT_WEIGHTS_URL);
        assert_eq!(settings.load_policy(), LoadPolicy::Tolerant { max_missing_ratio: 0.1 });
    }

    #[test]
    fn flags_override_defaults() {
        let settings = Settings::try_parse_from([
            "dog-emotion-server",
            "--init",
            "eager",
            "--load-policy",
            "strict",
            "--port",
            "9000",
        ])
        .unwrap();
        assert_eq!(settings.init, InitMode::Eager);
        assert_eq!(settings.engine().policy, LoadPolicy::Strict);
        assert_eq!(settings.port, 9000);
    }

    #[test]
    fn full_ratio_never_rejects_missing_parameters() {
        let settings = Settings::try_parse_from(["dog-emotion-server", "--max-missing-ratio", "1"]).unwrap();
        let policy = settings.load_policy();
        assert_eq!(policy, LoadPolicy::Tolerant { max_missing_ratio: 1.0 });

        let mostly_missing = LoadReport {
            matched: 2,
            missing: (0..300).map(|i| format!("blocks.{i}.weight")).collect(),
            unexpected: vec!["aux.weight".to_string()],
        };
        assert!(policy.check(&mostly_missing).is_ok());
        assert!(Settings::try_parse_from(["dog-emotion-server"]).unwrap().load_policy().check(&mostly_missing).is_err());
    }

    #[test]
    fn ratio_is_bounded() {
        assert!(Settings::try_parse_from(["dog-emotion-server", "--max-missing-ratio", "1.5"]).is_err());
        assert!(Settings::try_parse_from(["dog-emotion-server", "--max-missing-ratio", "abc"]).is_err());
    }
}
