//! Personas and the prompt templates built from them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the user asked the assistant to do with the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Chat,
    Explain,
    Translate,
    Optimize,
    FixError,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Explain,
        Action::Translate,
        Action::Optimize,
        Action::Chat,
        Action::FixError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Chat => "chat",
            Action::Explain => "explain",
            Action::Translate => "translate",
            Action::Optimize => "optimize",
            Action::FixError => "fix_error",
        }
    }

    /// Persona used when the requested one is not recognised.
    pub fn default_persona(&self) -> Persona {
        match self {
            Action::Optimize => Persona::Hacker,
            Action::FixError => Persona::Reviewer,
            Action::Chat | Action::Explain | Action::Translate => Persona::Teacher,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "chat" => Ok(Action::Chat),
            "explain" => Ok(Action::Explain),
            "translate" => Ok(Action::Translate),
            "optimize" => Ok(Action::Optimize),
            "fix_error" | "fix-error" | "fix" => Ok(Action::FixError),
            other => bail!(
                "unknown action '{other}', expected one of: {}",
                Action::ALL.map(|a| a.as_str()).join(", ")
            ),
        }
    }
}

/// Named response style passed along with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Teacher,
    Hacker,
    Reviewer,
}

impl Persona {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "teacher" => Some(Persona::Teacher),
            "hacker" => Some(Persona::Hacker),
            "reviewer" => Some(Persona::Reviewer),
            _ => None,
        }
    }

    /// Resolve a persona name for `action`, falling back to the action's default.
    pub fn resolve(name: &str, action: Action) -> Self {
        Self::from_name(name).unwrap_or_else(|| action.default_persona())
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Persona::Teacher => {
                "You are a patient programming teacher. Explain concepts clearly with examples, use simple language, and walk through problems step by step."
            }
            Persona::Hacker => {
                "You are a sharp, efficient hacker-style programmer. Give concise, advanced solutions focused on performance and clever techniques. Be direct and technical."
            }
            Persona::Reviewer => {
                "You are a thorough code reviewer. Analyse code quality, point out potential issues, and recommend concrete improvements. Be constructive and detailed."
            }
        }
    }
}

/// A rendered prompt: the persona's system text plus the task body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Single-string form for backends without chat roles.
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

pub fn build_prompt(
    action: Action,
    content: &str,
    persona: Persona,
    options: &HashMap<String, Value>,
) -> Prompt {
    let user = match action {
        Action::Explain => format!(
            "Please explain the following code:\n\n```\n{content}\n```\n\nExplain what this code does, how it works, and any important concepts involved."
        ),
        Action::Translate => {
            let target = option_str(options, "targetLanguage").unwrap_or("python");
            format!(
                "Please translate the following code to {target}:\n\n```\n{content}\n```\n\nProvide the translated code and explain any important differences or considerations."
            )
        }
        Action::Optimize => format!(
            "Please optimize the following code for performance, readability, and maintainability:\n\n```\n{content}\n```\n\nProvide the optimized version and explain what improved."
        ),
        Action::Chat => format!(
            "User message: {content}\n\nPlease respond helpfully as a programming assistant."
        ),
        Action::FixError => {
            let error = option_str(options, "error").unwrap_or_default();
            format!(
                "The following code is producing an error:\n\nCode:\n```\n{content}\n```\n\nError message:\n```\n{error}\n```\n\nAnalyse the error, explain what is wrong, and provide a corrected version of the code."
            )
        }
    };

    Prompt {
        system: persona.system_prompt().to_string(),
        user,
    }
}

fn option_str<'a>(options: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_persona_uses_action_default() {
        assert_eq!(Persona::resolve("pirate", Action::Optimize), Persona::Hacker);
        assert_eq!(Persona::resolve("pirate", Action::FixError), Persona::Reviewer);
        assert_eq!(Persona::resolve("pirate", Action::Chat), Persona::Teacher);
        assert_eq!(Persona::resolve("Reviewer", Action::Chat), Persona::Reviewer);
    }

    #[test]
    fn translate_prompt_uses_target_language_option() {
        let mut options = HashMap::new();
        options.insert("targetLanguage".to_string(), Value::from("rust"));
        let prompt = build_prompt(Action::Translate, "print(1)", Persona::Teacher, &options);
        assert!(prompt.user.contains("translate the following code to rust"));
        assert!(prompt.user.contains("print(1)"));
    }

    #[test]
    fn translate_prompt_defaults_to_python() {
        let prompt = build_prompt(Action::Translate, "x", Persona::Teacher, &HashMap::new());
        assert!(prompt.user.contains("to python"));
    }

    #[test]
    fn fix_error_prompt_embeds_error_message() {
        let mut options = HashMap::new();
        options.insert("error".to_string(), Value::from("NameError: y"));
        let prompt = build_prompt(Action::FixError, "x = y", Persona::Reviewer, &options);
        assert!(prompt.user.contains("NameError: y"));
        assert_eq!(prompt.system, Persona::Reviewer.system_prompt());
    }

    #[test]
    fn render_joins_system_and_user() {
        let prompt = build_prompt(Action::Chat, "hi", Persona::Hacker, &HashMap::new());
        let rendered = prompt.render();
        assert!(rendered.starts_with(Persona::Hacker.system_prompt()));
        assert!(rendered.ends_with("programming assistant."));
    }

    #[test]
    fn action_parses_aliases() {
        assert_eq!("fix-error".parse::<Action>().unwrap(), Action::FixError);
        assert_eq!("EXPLAIN".parse::<Action>().unwrap(), Action::Explain);
        let err = "refactor".parse::<Action>().unwrap_err().to_string();
        assert!(err.contains("explain, translate, optimize, chat, fix_error"));
    }

    #[test]
    fn action_serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&Action::FixError).unwrap(), "\"fix_error\"");
        let back: Action = serde_json::from_str("\"optimize\"").unwrap();
        assert_eq!(back, Action::Optimize);
    }
}
