//! Benchmark configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides, then CLI flags
//! override both. The file path defaults to `volley.yaml` but can be set with `-f` or the
//! `VOLLEY_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - models, prompts and defaults
//! 2. **Environment variables** - variables prefixed with `VOLLEY_` override YAML values
//! 3. **CLI flags** - `--number-of-calls`, `--concurrency` and `--output-dir`
//!
//! Nested values use double underscores, e.g. `VOLLEY_REQUEST_TIMEOUT=30s` or
//! `VOLLEY_API_KEY=sk-...`.
//!
//! ## Example
//!
//! ```yaml
//! endpoint: https://api.example.com/v1
//! number_of_calls: 50
//! concurrency: 8
//! models:
//!   - name: small
//!     model_id: acme/small-instruct
//!     max_tokens: 1024
//!     input_cost_per_1k_tokens: 0.00025
//!     output_cost_per_1k_tokens: 0.00125
//! prompts:
//!   - name: cloud
//!     description: Short business explainer
//!     prompt: What are the key benefits of cloud computing?
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Error, Result};
use crate::pricing::{PricingEntry, PricingTable};
use crate::types::{ModelParams, WorkItem};

/// Above this many calls per group a run logs a cost warning.
pub const LARGE_RUN_CALLS: u32 = 1000;

/// Label given to a prompt passed on the command line.
pub const CUSTOM_PROMPT_NAME: &str = "custom";

/// Concurrent load and cost benchmarking for text-generation APIs
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "VOLLEY_CONFIG", default_value = "volley.yaml")]
    pub config: String,

    /// Benchmark only this model (by configured name)
    #[arg(long)]
    pub model: Option<String>,

    /// Benchmark only this configured prompt (by name)
    #[arg(long, conflicts_with = "prompt")]
    pub prompt_name: Option<String>,

    /// Benchmark this prompt instead of the configured ones
    #[arg(long)]
    pub prompt: Option<String>,

    /// Calls per model per prompt
    #[arg(short = 'n', long)]
    pub number_of_calls: Option<u32>,

    /// Maximum calls in flight per group
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Directory under which the timestamped run directory is created
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Validate configuration and exit without sending any requests.
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    pub fn selection(&self) -> Selection {
        Selection {
            model: self.model.clone(),
            prompt_name: self.prompt_name.clone(),
            custom_prompt: self.prompt.clone(),
        }
    }
}

/// Which part of the configured (model, prompt) matrix to run.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub model: Option<String>,
    pub prompt_name: Option<String>,
    pub custom_prompt: Option<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the OpenAI-compatible API; requests go to `{endpoint}/chat/completions`
    pub endpoint: Url,
    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Calls per model per prompt
    pub number_of_calls: u32,
    /// Maximum calls in flight per group
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub models: Vec<ModelConfig>,
    pub prompts: Vec<PromptConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            number_of_calls: 100,
            concurrency: 10,
            output_dir: PathBuf::from("outputs"),
            models: Vec::new(),
            prompts: Vec::new(),
        }
    }
}

fn default_endpoint() -> Url {
    Url::parse("http://localhost:8000/v1").expect("default endpoint is a valid URL")
}

/// A model to benchmark and, optionally, its token pricing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Display name; also the pricing key
    pub name: String,
    /// Model identifier sent to the API
    pub model_id: String,
    #[serde(default = "ModelConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "ModelConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_1k_tokens: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_1k_tokens: Option<Decimal>,
}

impl ModelConfig {
    fn default_max_tokens() -> u32 {
        4096
    }

    fn default_temperature() -> f32 {
        0.7
    }

    pub fn params(&self) -> ModelParams {
        ModelParams {
            name: self.name.clone(),
            model_id: self.model_id.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    /// The model's pricing entry, if both costs are configured.
    pub fn pricing(&self) -> Option<PricingEntry> {
        match (self.input_cost_per_1k_tokens, self.output_cost_per_1k_tokens) {
            (Some(input), Some(output)) => Some(PricingEntry::new(&self.name, input, output)),
            _ => None,
        }
    }
}

/// A named prompt. Written verbatim as `prompt_info.json` in the run output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PromptConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
}

impl PromptConfig {
    pub fn custom(prompt: impl Into<String>) -> Self {
        Self {
            name: CUSTOM_PROMPT_NAME.to_string(),
            description: "Custom prompt provided via CLI".to_string(),
            prompt: prompt.into(),
        }
    }
}

impl Config {
    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // VOLLEY_CONFIG names the file itself
            .merge(Env::prefixed("VOLLEY_").ignore(&["config"]).split("__"))
    }

    /// Load, apply CLI overrides and validate.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(number_of_calls) = args.number_of_calls {
            config.number_of_calls = number_of_calls;
        }
        if let Some(concurrency) = args.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(output_dir) = &args.output_dir {
            config.output_dir = output_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::configuration("at least one model must be configured"));
        }
        if self.number_of_calls == 0 {
            return Err(Error::configuration("number_of_calls must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(Error::configuration("concurrency must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::configuration("request_timeout must be positive"));
        }

        let mut model_names = HashSet::new();
        for model in &self.models {
            if !model_names.insert(model.name.as_str()) {
                return Err(Error::configuration(format!("duplicate model name '{}'", model.name)));
            }
            if model.model_id.trim().is_empty() {
                return Err(Error::configuration(format!("model '{}' has an empty model_id", model.name)));
            }
            if model.max_tokens == 0 {
                return Err(Error::configuration(format!("max_tokens for model '{}' must be positive", model.name)));
            }
            if model.input_cost_per_1k_tokens.is_some() != model.output_cost_per_1k_tokens.is_some() {
                return Err(Error::configuration(format!(
                    "model '{}' must set both input_cost_per_1k_tokens and output_cost_per_1k_tokens, or neither",
                    model.name
                )));
            }
        }

        let mut prompt_names = HashSet::new();
        for prompt in &self.prompts {
            if !prompt_names.insert(prompt.name.as_str()) {
                return Err(Error::configuration(format!("duplicate prompt name '{}'", prompt.name)));
            }
            if prompt.prompt.trim().is_empty() {
                return Err(Error::configuration(format!("prompt '{}' is empty", prompt.name)));
            }
        }

        Ok(())
    }

    /// Pricing for every model that configures it.
    pub fn pricing_table(&self) -> Result<PricingTable> {
        PricingTable::from_entries(self.models.iter().filter_map(ModelConfig::pricing))
    }

    pub fn selected_models(&self, selection: &Selection) -> Result<Vec<&ModelConfig>> {
        match &selection.model {
            None => Ok(self.models.iter().collect()),
            Some(name) => self
                .models
                .iter()
                .find(|model| &model.name == name)
                .map(|model| vec![model])
                .ok_or_else(|| Error::configuration(format!("model '{name}' not found in configuration"))),
        }
    }

    pub fn selected_prompts(&self, selection: &Selection) -> Result<Vec<PromptConfig>> {
        if let Some(prompt) = &selection.custom_prompt {
            return Ok(vec![PromptConfig::custom(prompt.clone())]);
        }
        let prompts: Vec<PromptConfig> = match &selection.prompt_name {
            None => self.prompts.clone(),
            Some(name) => {
                let prompt = self
                    .prompts
                    .iter()
                    .find(|prompt| &prompt.name == name)
                    .ok_or_else(|| Error::configuration(format!("prompt '{name}' not found in configuration")))?;
                vec![prompt.clone()]
            }
        };
        if prompts.is_empty() {
            return Err(Error::configuration("no prompts configured; add prompts or pass --prompt"));
        }
        Ok(prompts)
    }

    /// The (prompt × model) matrix, prompts outermost.
    pub fn work_items(&self, selection: &Selection) -> Result<Vec<WorkItem>> {
        let models = self.selected_models(selection)?;
        let prompts = self.selected_prompts(selection)?;

        if self.number_of_calls > LARGE_RUN_CALLS {
            tracing::warn!(
                number_of_calls = self.number_of_calls,
                "Large number of calls may result in high costs and rate limiting"
            );
        }

        let items = prompts
            .iter()
            .flat_map(|prompt| {
                models
                    .iter()
                    .map(move |model| WorkItem::new(model.params(), &prompt.prompt, &prompt.name, self.number_of_calls))
            })
            .collect();
        Ok(items)
    }
}
