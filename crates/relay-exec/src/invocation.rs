use std::ffi::OsString;
use std::path::Path;

use relay_core::{SandboxMode, SessionId};

/// Fresh run or continuation of an earlier session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationMode {
    New { sandbox: SandboxMode },
    Resume { session_id: SessionId },
}

/// Arguments for `codex exec`. The instruction itself always travels on
/// stdin, signalled by the trailing `-`.
///
/// `resume` runs never get `-s`: the tool refuses a sandbox flag there.
pub fn build_args(cwd: &Path, model: Option<&str>, mode: &InvocationMode) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "exec".into(),
        "--json".into(),
        "--skip-git-repo-check".into(),
        "-C".into(),
        cwd.as_os_str().to_owned(),
    ];
    if let Some(model) = model {
        args.push("-m".into());
        args.push(model.into());
    }
    match mode {
        InvocationMode::New { sandbox } => {
            args.push("-s".into());
            args.push(sandbox.as_flag().into());
        }
        InvocationMode::Resume { session_id } => {
            args.push("resume".into());
            args.push(session_id.as_str().into());
        }
    }
    args.push("-".into());
    args
}
