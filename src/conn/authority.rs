use std::io::ErrorKind;
use std::path::Path;
use anyhow::Context;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use crate::conn::setup_block::PASSWORD_LEN;

/// Per-protocol passwords from the password file (`~/.KARMAauthority`).
///
/// Each data line is `<protocol-name> [<password>]`; blank lines and lines starting with `#`
///  are ignored. A protocol listed without a password explicitly has none. The same file
///  serves both sides: a client sends the password listed for a protocol, a server requires
///  it.
#[derive(Debug, Clone, Default)]
pub struct Authority {
    passwords: FxHashMap<String, Option<String>>,
}

impl Authority {
    pub fn parse(text: &str) -> Authority {
        let mut passwords = FxHashMap::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let protocol = match fields.next() {
                Some(p) => p,
                None => continue,
            };
            let password = fields.next();
            if fields.next().is_some() {
                warn!("password file line {}: ignoring trailing fields after the password", line_no + 1);
            }
            if let Some(pw) = password {
                if pw.len() >= PASSWORD_LEN {
                    warn!("password file line {}: password for protocol {:?} is too long - skipping", line_no + 1, protocol);
                    continue;
                }
            }
            passwords.insert(protocol.to_string(), password.map(|p| p.to_string()));
        }
        Authority { passwords }
    }

    /// A missing file is the same as an empty one
    pub fn load(path: &Path) -> anyhow::Result<Authority> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let result = Authority::parse(&text);
                debug!("read passwords for {} protocols from {:?}", result.passwords.len(), path);
                Ok(result)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no password file at {:?}", path);
                Ok(Authority::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading password file {:?}", path)),
        }
    }

    pub fn password(&self, protocol: &str) -> Option<&str> {
        self.passwords.get(protocol)
            .and_then(|pw| pw.as_deref())
    }
}
