use std::path::PathBuf;
use anyhow::bail;
use tracing::debug;
use transport::config::TransportConfig;

pub const DEFAULT_CM_CONTROL_ENV: &str = "KARMA_CM_CONTROL";
pub const AUTHORITY_FILE_NAME: &str = ".KARMAauthority";

/// Module names travel in the handshake; this keeps a misconfigured module from sending
///  something absurd
pub const MAX_MODULE_NAME_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// sent to peers during the handshake, see [crate::conn::ConnectionManager::peer_module_name]
    pub module_name: String,

    /// Password file, one `<protocol> [<password>]` per line. `None` means no passwords are
    ///  configured at all.
    pub authority_file: Option<PathBuf>,

    /// Name of the environment variable that, if present, holds `host:port:x:y` of a
    ///  Connection Management tool supervising this module
    pub cm_control_env: String,

    /// where log output goes while supervised by a Connection Management tool
    pub cm_log_dir: PathBuf,

    /// used to recognize connection attempts to this very host
    pub local_hostname: String,

    pub transport: TransportConfig,
}

impl ConnConfig {
    pub fn new(module_name: impl Into<String>) -> ConnConfig {
        ConnConfig {
            module_name: module_name.into(),
            authority_file: std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(AUTHORITY_FILE_NAME)),
            cm_control_env: DEFAULT_CM_CONTROL_ENV.to_string(),
            cm_log_dir: std::env::temp_dir(),
            local_hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            transport: TransportConfig::default(),
        }
    }

    pub fn from_env(module_name: impl Into<String>) -> anyhow::Result<ConnConfig> {
        let mut result = ConnConfig::new(module_name);
        result.transport = TransportConfig::from_env()?;
        debug!("local host name is {:?}", result.local_hostname);

        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.module_name.is_empty() {
            bail!("module name must not be empty");
        }
        if self.module_name.len() > MAX_MODULE_NAME_LEN {
            bail!("module name must not be longer than {} bytes: {:?}", MAX_MODULE_NAME_LEN, self.module_name);
        }
        if self.cm_control_env.is_empty() {
            bail!("name of the Connection Management control variable must not be empty");
        }
        self.transport.validate()
    }

    /// `<cm_log_dir>/karma_cm_<pid>.log`
    pub fn cm_log_path(&self) -> PathBuf {
        self.cm_log_dir.join(format!("karma_cm_{}.log", std::process::id()))
    }
}
