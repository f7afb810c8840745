//! Scratch directory for a single encode.
//!
//! The encoder works on in-memory bytes, but ffmpeg wants files. A
//! [`Workspace`] owns a temporary directory holding the source and the
//! encoded output; both are removed when it is dropped.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;
use vf_core::Error;

const INPUT_NAME: &str = "source";

/// Temporary directory holding one encode's input and output.
///
/// # Example
///
/// ```no_run
/// use vf_av::Workspace;
///
/// # async fn example(source: bytes::Bytes) -> vf_core::Result<()> {
/// let ws = Workspace::new("converted_720p.mp4")?;
/// ws.write_input(&source).await?;
/// // ... run ffmpeg from ws.input() to ws.output() ...
/// let encoded = ws.read_output().await?;
/// # Ok(())
/// # }
/// ```
pub struct Workspace {
    temp_dir: TempDir,
    output_name: String,
}

impl Workspace {
    /// Create a new workspace whose output file is called `output_name`.
    ///
    /// The output extension selects the ffmpeg muxer, so it should be a
    /// real container extension such as `.mp4`.
    pub fn new(output_name: impl Into<String>) -> vf_core::Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("vidforge-")
            .tempdir()
            .map_err(|e| Error::tool("workspace", format!("failed to create temp dir: {e}")))?;

        Ok(Self {
            temp_dir,
            output_name: output_name.into(),
        })
    }

    /// Path the source bytes are written to.
    pub fn input(&self) -> PathBuf {
        self.temp_dir.path().join(INPUT_NAME)
    }

    /// Path the encoder writes its result to.
    pub fn output(&self) -> PathBuf {
        self.temp_dir.path().join(&self.output_name)
    }

    /// Path to the temporary directory.
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write the source media into the workspace.
    pub async fn write_input(&self, data: &[u8]) -> vf_core::Result<()> {
        tokio::fs::write(self.input(), data)
            .await
            .map_err(|e| Error::tool("workspace", format!("failed to write input: {e}")))
    }

    /// Read the encoded output back into memory.
    ///
    /// # Errors
    ///
    /// Fails if the output is missing or empty.
    pub async fn read_output(&self) -> vf_core::Result<Bytes> {
        let output = self.output();
        let data = tokio::fs::read(&output).await.map_err(|e| {
            Error::tool(
                "workspace",
                format!("failed to read output {}: {e}", output.display()),
            )
        })?;
        if data.is_empty() {
            return Err(Error::tool(
                "workspace",
                format!("output file is empty: {}", output.display()),
            ));
        }
        Ok(Bytes::from(data))
    }
}
