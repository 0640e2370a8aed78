use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use image::ImageFormat;
use tracing::{debug, info};

use crate::tasks::converter::Rendering;
use crate::tasks::display::{PanelCommand, PanelDriver};

pub const FRAME_FILE_NAME: &str = "frame.png";

#[derive(Debug, Clone, Default)]
pub struct PanelCommandPlan {
    /// Directory the current frame is spooled into before each command.
    pub spool_dir: PathBuf,
    /// Shell template run after each frame; `{frame}` and `{command}` expand.
    pub show_command: Option<String>,
    pub hold_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

type CommandRunner = Arc<dyn Fn(&str) -> Result<CommandOutput> + Send + Sync>;

/// Panel driver that hands frames to an external vendor tool via `sh -c`.
pub struct CommandPanel {
    frame_path: PathBuf,
    show_command: Option<String>,
    hold_command: Option<String>,
    runner: CommandRunner,
}

impl fmt::Debug for CommandPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPanel")
            .field("frame_path", &self.frame_path)
            .field("show_command", &self.show_command)
            .field("hold_command", &self.hold_command)
            .finish()
    }
}

impl CommandPanel {
    pub fn new(plan: PanelCommandPlan) -> Result<Self> {
        Self::build(plan, default_runner())
    }

    fn build(plan: PanelCommandPlan, runner: CommandRunner) -> Result<Self> {
        let PanelCommandPlan {
            spool_dir,
            show_command,
            hold_command,
        } = plan;
        for (label, cmd) in [("show command", &show_command), ("hold command", &hold_command)] {
            if let Some(cmd) = cmd {
                ensure_not_blank(cmd, label)?;
            }
        }
        fs::create_dir_all(&spool_dir)
            .with_context(|| format!("failed to create spool directory {}", spool_dir.display()))?;
        Ok(Self {
            frame_path: spool_dir.join(FRAME_FILE_NAME),
            show_command,
            hold_command,
            runner,
        })
    }

    #[cfg(test)]
    fn with_runner(plan: PanelCommandPlan, runner: CommandRunner) -> Result<Self> {
        Self::build(plan, runner)
    }

    fn spool(&self, frame: &Rendering) -> Result<()> {
        let image = frame
            .to_image()
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let tmp = self.frame_path.with_extension("png.tmp");
        image
            .save_with_format(&tmp, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.frame_path)
            .with_context(|| format!("failed to replace {}", self.frame_path.display()))
    }

    fn run(&self, template: &str, command: PanelCommand) -> Result<()> {
        let line = expand(template, &self.frame_path, command);
        debug!(command = %line, "running panel command");
        let output = (self.runner)(&line)?;
        if !output.status.success() {
            bail!(
                "'{line}' exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

impl PanelDriver for CommandPanel {
    fn render(&mut self, frame: &Rendering, command: PanelCommand) -> Result<()> {
        self.spool(frame)?;
        match self.show_command.as_deref() {
            Some(template) => self.run(template, command),
            None => {
                info!(frame = %self.frame_path.display(), %command, "frame spooled; no show command configured");
                Ok(())
            }
        }
    }

    fn hold(&mut self) -> Result<()> {
        match self.hold_command.as_deref() {
            Some(template) => self.run(template, PanelCommand::Hold),
            None => Ok(()),
        }
    }
}

fn expand(template: &str, frame: &Path, command: PanelCommand) -> String {
    template
        .replace("{frame}", &frame.display().to_string())
        .replace("{command}", command.as_str())
}

fn ensure_not_blank(value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(anyhow!("{label} must not be blank"))
    } else {
        Ok(())
    }
}

fn default_runner() -> CommandRunner {
    Arc::new(|command| run_shell(command))
}

fn run_shell(command: &str) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to spawn shell for command: {command}"))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
