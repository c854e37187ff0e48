//! Text-to-speech fallback used when the backend returns fulfillment text
//! without fulfillment audio.

use anyhow::Result;
use std::path::Path;

/// On-demand synthesis of a short prompt into an audio file.
pub trait SynthesisClient: Send + Sync {
    fn synthesize(
        &self,
        auth_key: &str,
        text: &str,
        language: &str,
        voice_hint: Option<&str>,
        destination: &Path,
    ) -> Result<()>;
}
