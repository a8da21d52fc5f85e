use thiserror::Error;

/// Process exit status for a [Fatal] error that reaches the top level.
pub const FATAL_EXIT_STATUS: i32 = 74;

/// Conditions after which the process can not usefully continue: a peer and the local side
///  would disagree on the state of a shared stream, or the module's connection state stopped
///  being observable by its supervisor.
///
/// Library code never exits the process. It returns this error, and the application's top
///  level handler terminates with [FATAL_EXIT_STATUS] (see [is_fatal]).
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("short write while writing {what}: {reason}")]
    ShortWrite { what: &'static str, reason: String },

    #[error("lost the control connection to the connection management tool")]
    ControlConnectionLost,

    #[error("could not notify the connection management tool: {0}")]
    CmToolNotify(String),
}

impl Fatal {
    pub fn short_write(what: &'static str, e: anyhow::Error) -> anyhow::Error {
        Fatal::ShortWrite { what, reason: format!("{:#}", e) }.into()
    }
}

/// true if a [Fatal] error is anywhere in the error's chain
pub fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.downcast_ref::<Fatal>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_is_fatal_direct() {
        let e: anyhow::Error = Fatal::ControlConnectionLost.into();
        assert!(is_fatal(&e));
    }

    #[test]
    fn test_is_fatal_with_context() {
        let e = Fatal::short_write("array", anyhow!("broken pipe"));
        let e = Err::<(), _>(e).context("writing multi array").unwrap_err();
        assert!(is_fatal(&e));
        assert!(format!("{:#}", e).contains("broken pipe"));
    }

    #[test]
    fn test_not_fatal() {
        let e = anyhow!("connection reset by peer");
        assert!(!is_fatal(&e));
    }
}
