pub mod subscription;
pub mod types;

use anyhow::{Context, Result};

pub use types::Config;

/// 从 YAML 文件加载配置
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path))?;
    let config: Config =
        serde_yml::from_str(&content).with_context(|| format!("parse config file: {}", path))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_minimal_config() {
        let yaml = r#"
outbounds:
  - { tag: direct, type: direct }
  - tag: main
    type: selector
    outbounds: [direct]
route:
  final: main
"#;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(tmp, "{}", yaml).unwrap();

        let config = load_config(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(config.outbounds.len(), 2);
        assert_eq!(config.route.final_tag, "main");
        assert_eq!(config.outbounds[1].group.outbounds, vec!["direct"]);
    }

    #[test]
    fn load_rejects_duplicate_tags() {
        let yaml = "outbounds:\n  - { tag: a, type: direct }\n  - { tag: a, type: direct }\n";
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(tmp, "{}", yaml).unwrap();
        assert!(load_config(tmp.path().to_str().unwrap()).is_err());
    }
}
