use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant participating in a small group chat. \
     Provide concise, accurate answers suitable for a shared chat context. \
     Cite facts succinctly when helpful and avoid extremely long messages.";

pub const DEFAULT_USER_TURN_TEMPLATE: &str = "{author}: {content}";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt template '{0}' is invalid: missing {{content}} placeholder")]
    InvalidTemplate(String),
    #[error("Prompt file IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Prompt JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Rendering of user turns for the upstream; `{author}` and `{content}` are substituted.
    #[serde(default = "default_user_turn_template")]
    pub user_turn_template: String,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_user_turn_template() -> String {
    DEFAULT_USER_TURN_TEMPLATE.to_string()
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            user_turn_template: default_user_turn_template(),
            last_loaded: None,
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        if !self.user_turn_template.contains("{content}") {
            return Err(PromptError::InvalidTemplate("user_turn_template".to_string()));
        }
        Ok(())
    }

    pub fn render_user_turn(&self, author: Option<&str>, content: &str) -> String {
        match author {
            Some(author) =>
                self.user_turn_template.replace("{author}", author).replace("{content}", content),
            None => content.to_string(),
        }
    }
}

pub fn load_prompts_from_str(json: &str) -> Result<PromptConfig, PromptError> {
    let config: PromptConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(&path)?;
    let mut config = load_prompts_from_str(&file_content)?;
    config.last_loaded = Some(SystemTime::now());
    info!("Loaded prompts from {}", path.as_ref().display());
    Ok(Arc::new(config))
}

/// Built-in prompts when no path is configured.
pub fn load_or_default(path: Option<&str>) -> Result<Arc<PromptConfig>, PromptError> {
    match path {
        Some(p) if !p.trim().is_empty() => load_prompts(p),
        _ => Ok(Arc::new(PromptConfig::default())),
    }
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current_config: &Arc<PromptConfig>
) -> Result<Option<Arc<PromptConfig>>, PromptError> {
    let metadata = fs::metadata(&path)?;

    if let Ok(modified) = metadata.modified() {
        if let Some(last_loaded) = current_config.last_loaded {
            if modified > last_loaded {
                info!("Prompts file changed, reloading...");
                return Ok(Some(load_prompts(path)?));
            }
        } else {
            info!("No last_loaded timestamp, reloading prompts...");
            return Ok(Some(load_prompts(path)?));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = load_prompts_from_str(r#"{ "system_prompt": "Be terse." }"#).unwrap();
        assert_eq!(config.system_prompt, "Be terse.");
        assert_eq!(config.user_turn_template, DEFAULT_USER_TURN_TEMPLATE);
    }

    #[test]
    fn template_without_content_is_rejected() {
        let result = load_prompts_from_str(r#"{ "user_turn_template": "{author} said something" }"#);
        assert!(matches!(result, Err(PromptError::InvalidTemplate(_))));
    }

    #[test]
    fn renders_user_turns() {
        let config = PromptConfig::default();
        assert_eq!(config.render_user_turn(Some("alice"), "Hi"), "alice: Hi");
        assert_eq!(config.render_user_turn(None, "Hi"), "Hi");
    }

    #[test]
    fn reload_only_when_never_loaded_or_modified() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "system_prompt": "v1" }}"#).unwrap();

        let loaded = load_prompts(file.path()).unwrap();
        assert_eq!(loaded.system_prompt, "v1");
        assert!(reload_prompts_if_changed(file.path(), &loaded).unwrap().is_none());

        let builtin = Arc::new(PromptConfig::default());
        let reloaded = reload_prompts_if_changed(file.path(), &builtin).unwrap().unwrap();
        assert_eq!(reloaded.system_prompt, "v1");
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(load_or_default(Some("/nonexistent/prompts.json")), Err(PromptError::IoError(_))));
        assert_eq!(load_or_default(None).unwrap().system_prompt, DEFAULT_SYSTEM_PROMPT);
    }
}
