//! Typing the boot command over the VM keyboard
//!
//! Boot commands are text with `<special>` keys and `<waitN>` pauses. They
//! are turned into PC scancode set 1 sequences and sent with
//! `VBoxManage controlvm keyboardputscancode`.

use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::core::template;
use crate::steps::{cancel_signal, require, sleep_unless_cancelled, ui};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Scancodes sent per VBoxManage invocation
const CODES_PER_CALL: usize = 25;

const SHIFT_PRESS: u8 = 0x2a;
const SHIFT_RELEASE: u8 = 0xaa;
const RELEASE: u8 = 0x80;

/// Rows of the US keyboard: unshifted, shifted and the scancode of the
/// first key
const ROWS: [(&str, &str, u8); 4] = [
    ("1234567890-=", "!@#$%^&*()_+", 0x02),
    ("qwertyuiop[]", "QWERTYUIOP{}", 0x10),
    ("asdfghjkl;'`", "ASDFGHJKL:\"~", 0x1e),
    ("\\zxcvbnm,./", "|ZXCVBNM<>?", 0x2b),
];

const SPECIAL: [(&str, u8); 28] = [
    ("bs", 0x0e),
    ("del", 0x53),
    ("enter", 0x1c),
    ("return", 0x1c),
    ("esc", 0x01),
    ("f1", 0x3b),
    ("f2", 0x3c),
    ("f3", 0x3d),
    ("f4", 0x3e),
    ("f5", 0x3f),
    ("f6", 0x40),
    ("f7", 0x41),
    ("f8", 0x42),
    ("f9", 0x43),
    ("f10", 0x44),
    ("f11", 0x57),
    ("f12", 0x58),
    ("tab", 0x0f),
    ("up", 0x48),
    ("down", 0x50),
    ("left", 0x4b),
    ("right", 0x4d),
    ("spacebar", 0x39),
    ("insert", 0x52),
    ("home", 0x47),
    ("end", 0x4f),
    ("pageup", 0x49),
    ("pagedown", 0x51),
];

/// One thing to do while typing a boot command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Scancodes as two-digit hex strings
    Codes(Vec<String>),
    Wait(Duration),
}

fn press(code: u8) -> [u8; 2] {
    [code, code | RELEASE]
}

fn char_codes(c: char) -> Option<Vec<u8>> {
    if c == ' ' {
        return Some(press(0x39).to_vec());
    }

    for (plain, shifted, base) in ROWS {
        if let Some(i) = plain.chars().position(|p| p == c) {
            return Some(press(base + i as u8).to_vec());
        }
        if let Some(i) = shifted.chars().position(|p| p == c) {
            let [down, up] = press(base + i as u8);
            return Some(vec![SHIFT_PRESS, down, up, SHIFT_RELEASE]);
        }
    }
    None
}

fn special_code(token: &str) -> Option<u8> {
    let token = token.to_lowercase();
    SPECIAL
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, code)| *code)
}

fn wait_duration(token: &str) -> Option<Duration> {
    let seconds = token.strip_prefix("wait")?;
    if seconds.is_empty() {
        return Some(Duration::from_secs(1));
    }
    seconds.parse().ok().map(Duration::from_secs)
}

/// Translate one boot command into scancode groups and waits
pub fn scancodes(command: &str) -> Vec<KeyAction> {
    let mut actions = Vec::new();
    let mut codes: Vec<u8> = Vec::new();
    let mut rest = command;

    let flush = |codes: &mut Vec<u8>, actions: &mut Vec<KeyAction>| {
        if !codes.is_empty() {
            let hex = codes.drain(..).map(|c| format!("{:02x}", c)).collect();
            actions.push(KeyAction::Codes(hex));
        }
    };

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(end) = rest.find('>') {
                let token = &rest[1..end];
                if let Some(wait) = wait_duration(token) {
                    flush(&mut codes, &mut actions);
                    actions.push(KeyAction::Wait(wait));
                    rest = &rest[end + 1..];
                    continue;
                }
                if let Some(code) = special_code(token) {
                    codes.extend(press(code));
                    rest = &rest[end + 1..];
                    continue;
                }
            }
        }

        match char_codes(c) {
            Some(seq) => codes.extend(seq),
            None => warn!("No scancode for {:?}, skipping", c),
        }
        rest = &rest[c.len_utf8()..];
    }

    flush(&mut codes, &mut actions);
    actions
}

/// Types the boot command into the running VM
#[derive(Debug, Clone)]
pub struct TypeBootCommand {
    /// Command templates; `name`, `vrdp_port` and `ssh_host_port` are
    /// available
    pub commands: Vec<String>,
}

impl TypeBootCommand {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.commands.is_empty() {
            return Ok(StepAction::Continue);
        }

        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        let signal = cancel_signal(state);

        let mut variables = HashMap::new();
        variables.insert("name".to_string(), name.clone());
        if let Some(port) = state.get::<keys::VrdpPort>() {
            variables.insert("vrdp_port".to_string(), port.to_string());
        }
        if let Some(port) = state.get::<keys::SshHostPort>() {
            variables.insert("ssh_host_port".to_string(), port.to_string());
        }

        ui(state).say("Typing the boot command...");
        for command in &self.commands {
            let rendered = template::render(command, &variables);
            for action in scancodes(&rendered) {
                if signal.is_cancelled() {
                    return Ok(StepAction::Halt);
                }

                match action {
                    KeyAction::Wait(duration) => {
                        debug!("Waiting {:?} during boot command", duration);
                        if !sleep_unless_cancelled(&signal, duration).await {
                            return Ok(StepAction::Halt);
                        }
                    }
                    KeyAction::Codes(codes) => {
                        for chunk in codes.chunks(CODES_PER_CALL) {
                            let mut args = vec![
                                "controlvm".to_string(),
                                name.clone(),
                                "keyboardputscancode".to_string(),
                            ];
                            args.extend(chunk.iter().cloned());
                            driver
                                .vboxmanage(&args)
                                .await
                                .context("Error sending boot command")?;
                        }
                    }
                }
            }
        }

        Ok(StepAction::Continue)
    }
}
