// ============================================================================
// src/ui.rs – Presenters: headless (logs only) and console (spinner + menu)
// ============================================================================

use console::Style;
use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    terminal::{Clear, ClearType},
    ExecutableCommand,
};
use dialoguer::Select;
use std::io::{self, Write};
use tracing::{error, info, warn};

use crate::mode::RecoveryMode;

const SPINNER: [&str; 4] = ["◐", "◓", "◑", "◒"];

/// What the operator decided on the recovery-type page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Proceed(RecoveryMode),
    Cancel,
}

/// Everything the workflow needs from whoever is in front of the machine.
pub trait Presenter {
    /// Currently selected recovery type.
    fn mode(&self) -> RecoveryMode;
    fn set_mode(&mut self, mode: RecoveryMode);
    fn allow_forward(&mut self, allowed: bool);
    fn set_genuine(&mut self, genuine: bool);
    fn show_progress(&mut self, message: &str);
    /// Called repeatedly while the build worker runs.
    fn pump(&mut self);
    fn hide_progress(&mut self);
    fn show_error(&mut self, message: &str);
    fn show_reboot(&mut self);
    fn await_selection(&mut self) -> Selection;
}

/// Page state shared by every presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceState {
    pub mode: RecoveryMode,
    pub forward: bool,
    /// Automatic and interactive can be picked.
    pub choices_enabled: bool,
    pub hdd_notice: bool,
    pub genuine: bool,
}

impl Default for ChoiceState {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::Unset,
            forward: true,
            choices_enabled: true,
            hdd_notice: false,
            genuine: true,
        }
    }
}

impl ChoiceState {
    /// Automatic and interactive select their choice; anything else selects
    /// the hidden one and, unless factory, blocks forward.
    pub fn set_mode(&mut self, mode: RecoveryMode) {
        self.mode = mode;
        match mode {
            RecoveryMode::Automatic | RecoveryMode::Interactive | RecoveryMode::Factory => {}
            RecoveryMode::Hdd => {
                self.forward = false;
                self.hdd_notice = true;
                self.choices_enabled = false;
            }
            RecoveryMode::Unset => self.forward = false,
        }
    }

    pub fn set_genuine(&mut self, genuine: bool) {
        self.genuine = genuine;
        if !genuine {
            self.choices_enabled = false;
            self.forward = false;
        }
    }

    /// Page shown again: a non-genuine platform never moves forward.
    pub fn on_show(&mut self) {
        if !self.genuine {
            self.forward = false;
        }
    }

    /// Operator picked `mode`. Returns false when that choice is disabled.
    pub fn select(&mut self, mode: RecoveryMode) -> bool {
        let user_choice = matches!(mode, RecoveryMode::Automatic | RecoveryMode::Interactive);
        if user_choice && !self.choices_enabled {
            return false;
        }
        self.mode = mode;
        self.forward = true;
        true
    }
}

/// Unattended hosts: every notice goes to the log.
#[derive(Debug, Default)]
pub struct HeadlessPresenter {
    state: ChoiceState,
    forced: Option<RecoveryMode>,
}

impl HeadlessPresenter {
    pub fn new(forced: Option<RecoveryMode>) -> Self {
        Self {
            state: ChoiceState::default(),
            forced,
        }
    }

    pub fn state(&self) -> &ChoiceState {
        &self.state
    }
}

impl Presenter for HeadlessPresenter {
    fn mode(&self) -> RecoveryMode {
        self.state.mode
    }

    fn set_mode(&mut self, mode: RecoveryMode) {
        self.state.set_mode(mode);
    }

    fn allow_forward(&mut self, allowed: bool) {
        self.state.forward = allowed;
    }

    fn set_genuine(&mut self, genuine: bool) {
        self.state.set_genuine(genuine);
        if !genuine {
            warn!("platform check failed; automatic and interactive recovery disabled");
        }
    }

    fn show_progress(&mut self, message: &str) {
        info!("{message}");
    }

    fn pump(&mut self) {}

    fn hide_progress(&mut self) {}

    fn show_error(&mut self, message: &str) {
        error!("{message}");
    }

    fn show_reboot(&mut self) {
        info!("recovery partition ready; remove the installation medium, rebooting");
    }

    /// Without `--mode` only a factory answer proceeds; any other stored
    /// choice was cleared in `prepare` and must come from an operator.
    fn await_selection(&mut self) -> Selection {
        self.state.on_show();
        match self.forced {
            Some(mode) => {
                if !self.state.select(mode) {
                    warn!(mode = %mode, "requested recovery type is disabled");
                }
            }
            None if self.state.mode == RecoveryMode::Factory => {}
            None => {
                warn!(
                    stored = %self.state.mode,
                    "no recovery type requested and nobody to ask"
                );
                self.state.set_mode(RecoveryMode::Unset);
            }
        }
        info!(mode = %self.state.mode, "recovery type");
        Selection::Proceed(self.state.mode)
    }
}

/// Terminal front end: a menu for the choice and a spinner while building.
pub struct ConsolePresenter {
    state: ChoiceState,
    heading: Style,
    notice: Style,
    failure: Style,
    frame: usize,
    spinning: Option<String>,
}

impl Default for ConsolePresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePresenter {
    pub fn new() -> Self {
        Self {
            state: ChoiceState::default(),
            heading: Style::new().cyan().bold(),
            notice: Style::new().yellow(),
            failure: Style::new().red().bold(),
            frame: 0,
            spinning: None,
        }
    }

    fn draw_spinner(&mut self) -> io::Result<()> {
        let Some(message) = &self.spinning else {
            return Ok(());
        };
        let mut stdout = io::stdout();
        stdout.execute(MoveToColumn(0))?;
        stdout.execute(Clear(ClearType::CurrentLine))?;
        write!(stdout, "{} {}", SPINNER[self.frame % SPINNER.len()], message)?;
        stdout.flush()?;
        self.frame = self.frame.wrapping_add(1);
        Ok(())
    }

    fn choices(&self) -> Vec<(Selection, &'static str)> {
        let mut items = Vec::new();
        if self.state.choices_enabled {
            items.push((
                Selection::Proceed(RecoveryMode::Automatic),
                "Restore the factory image (automatic recovery)",
            ));
            items.push((
                Selection::Proceed(RecoveryMode::Interactive),
                "Partition manually (interactive recovery)",
            ));
        }
        items.push((Selection::Cancel, "Cancel and reboot"));
        items
    }
}

impl Presenter for ConsolePresenter {
    fn mode(&self) -> RecoveryMode {
        self.state.mode
    }

    fn set_mode(&mut self, mode: RecoveryMode) {
        self.state.set_mode(mode);
    }

    fn allow_forward(&mut self, allowed: bool) {
        self.state.forward = allowed;
    }

    fn set_genuine(&mut self, genuine: bool) {
        self.state.set_genuine(genuine);
    }

    fn show_progress(&mut self, message: &str) {
        let _ = io::stdout().execute(Hide);
        self.spinning = Some(message.to_string());
        let _ = self.draw_spinner();
    }

    fn pump(&mut self) {
        let _ = self.draw_spinner();
    }

    fn hide_progress(&mut self) {
        if self.spinning.take().is_some() {
            let mut stdout = io::stdout();
            let _ = stdout.execute(MoveToColumn(0));
            let _ = stdout.execute(Clear(ClearType::CurrentLine));
        }
        let _ = io::stdout().execute(Show);
    }

    fn show_error(&mut self, message: &str) {
        self.hide_progress();
        eprintln!("{}", self.failure.apply_to("Recovery failed"));
        eprintln!("{message}");
    }

    fn show_reboot(&mut self) {
        self.hide_progress();
        println!(
            "{}",
            self.heading
                .apply_to("Recovery partition ready. Remove the installation medium; the system will reboot.")
        );
    }

    fn await_selection(&mut self) -> Selection {
        self.state.on_show();
        if self.state.mode == RecoveryMode::Factory {
            return Selection::Proceed(RecoveryMode::Factory);
        }

        println!("{}", self.heading.apply_to("Recovery type"));
        if !self.state.genuine {
            println!("{}", self.notice.apply_to("This platform is not supported for recovery."));
        }
        if self.state.hdd_notice {
            println!(
                "{}",
                self.notice
                    .apply_to("Booted from the hard drive recovery partition; only cancel is available.")
            );
        }

        let items = self.choices();
        let labels: Vec<&str> = items.iter().map(|(_, label)| *label).collect();
        let preselect = items
            .iter()
            .position(|(sel, _)| *sel == Selection::Proceed(self.state.mode))
            .unwrap_or(0);

        match Select::new().items(&labels).default(preselect).interact() {
            Ok(index) => match items[index].0 {
                Selection::Proceed(mode) => {
                    self.state.select(mode);
                    Selection::Proceed(mode)
                }
                Selection::Cancel => Selection::Cancel,
            },
            Err(err) => {
                warn!(error = %err, "selection prompt unavailable");
                Selection::Proceed(self.state.mode)
            }
        }
    }
}
