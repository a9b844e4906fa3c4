use serde::{Deserialize, Serialize};

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default root directory for moment clips when a `start_stream` command doesn't supply
    /// its own `save_location`.
    pub moments_dir: String,

    /// URI prefix that marks a source as "always wanted to loop" (spec §4.5): the supervisor
    /// restarts immediately on graceful end instead of exiting.
    #[serde(default = "default_loop_prefix")]
    pub loop_uri_prefix: String,
}

fn default_loop_prefix() -> String {
    "demo://".to_string()
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config.yaml").required(false))
            .add_source(config::Environment::with_prefix("APP"));
        Ok(builder.build()?.try_deserialize()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            moments_dir: "moments".to_string(),
            loop_uri_prefix: default_loop_prefix(),
        }
    }
}
