use std::time::Duration;

/// Tunables the resource machines read at start time.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub connect_timeout: Option<Duration>,
    pub disconnect_timeout: Option<Duration>,
    /// Downloads may legitimately run for a long time; unbounded by default.
    pub pull_timeout: Option<Duration>,
    pub index_timeout: Option<Duration>,
    /// `base_url` recorded on credential entries for pulled models.
    pub ollama_base_url: String,
    pub error_max_chars: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            disconnect_timeout: Some(Duration::from_secs(10)),
            pull_timeout: None,
            index_timeout: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            error_max_chars: 120,
        }
    }
}
