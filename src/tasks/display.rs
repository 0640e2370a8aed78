use std::fmt;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::DisplayError;
use crate::tasks::converter::{Decoder, PanelSpec, Rendering};

/// Command sent alongside a frame so the driver can pick its refresh mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelCommand {
    ShowMessage,
    ShowImage,
    Hold,
}

impl PanelCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShowMessage => "show_message",
            Self::ShowImage => "show_image",
            Self::Hold => "hold",
        }
    }
}

impl fmt::Display for PanelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The physical panel. Implementations block until the transfer completes.
pub trait PanelDriver {
    fn render(&mut self, frame: &Rendering, command: PanelCommand) -> anyhow::Result<()>;

    /// Keep the current image; e-paper retains it without power.
    fn hold(&mut self) -> anyhow::Result<()>;
}

/// Sole owner of the panel driver.
pub struct DisplayManager<P> {
    driver: P,
    boot: Rendering,
}

impl<P: PanelDriver> DisplayManager<P> {
    pub fn new(driver: P, boot: Rendering) -> Self {
        Self { driver, boot }
    }

    pub fn driver(&self) -> &P {
        &self.driver
    }

    pub fn show_boot(&mut self) -> Result<(), DisplayError> {
        info!("showing boot picture");
        self.send(PanelCommand::ShowMessage, None)
    }

    pub fn show(&mut self, frame: &Rendering) -> Result<(), DisplayError> {
        self.send(PanelCommand::ShowImage, Some(frame))
    }

    pub fn hold(&mut self) -> Result<(), DisplayError> {
        debug!("holding current frame");
        self.driver.hold().map_err(|reason| DisplayError::Transfer {
            command: PanelCommand::Hold,
            reason,
        })
    }

    fn send(&mut self, command: PanelCommand, frame: Option<&Rendering>) -> Result<(), DisplayError> {
        let frame = frame.unwrap_or(&self.boot);
        self.driver
            .render(frame, command)
            .map_err(|reason| DisplayError::Transfer { command, reason })
    }
}

/// Decode the boot asset for the panel, or fall back to a blank frame.
pub fn load_boot_frame(asset: &Path, panel: PanelSpec, decoder: &impl Decoder) -> Rendering {
    match decoder.decode(asset, panel) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(path = %asset.display(), error = %err, "boot picture unavailable; using blank frame");
            Rendering::blank(panel)
        }
    }
}
