//! Decides whether a user-supplied argv should be passed through
//! verbatim or quote-joined and wrapped as `bash -lc '<joined>'`.
//!
//! Built on `shell-words` for the quoting half of the job.

use std::collections::HashMap;

/// What the worker should actually execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCommand {
    pub argv: Vec<String>,
    pub use_shell: bool,
}

/// If the user already wrote an explicit shell invocation
/// (`bash -lc '...'`, `sh -c '...'`), pass it through untouched.
/// Otherwise join+quote the argv and wrap it, rewriting any
/// `remote_env` key that looks like it was already expanded locally
/// (`$FOO` or `${FOO}`) back into a literal so the *remote* shell
/// expands it instead.
pub fn normalize(argv: &[String], remote_env: &HashMap<String, String>) -> NormalizedCommand {
    if looks_like_explicit_shell(argv) {
        return NormalizedCommand {
            argv: argv.to_vec(),
            use_shell: false,
        };
    }

    let rewritten: Vec<String> = argv
        .iter()
        .map(|arg| relitteralize_remote_env_refs(arg, remote_env))
        .collect();
    let joined = shell_words::join(&rewritten);

    NormalizedCommand {
        argv: vec!["bash".to_string(), "-lc".to_string(), joined],
        use_shell: true,
    }
}

fn looks_like_explicit_shell(argv: &[String]) -> bool {
    matches!(
        argv.first().map(String::as_str),
        Some("bash" | "sh" | "zsh" | "dash")
    ) && argv.iter().any(|a| a == "-c" || a == "-lc")
}

/// A local shell would already have expanded `$VAR`/`${VAR}` before
/// this process ever saw the argv. If `VAR` is one of the keys the
/// request will carry in `remote_env`, that expansion happened against
/// the *local* value — almost never what the user wants once the
/// command runs on the worker. We can't undo a shell expansion that has
/// already happened, but we can catch the common case where the user
/// wrote the reference inside a quoted argument that reached us intact
/// (e.g. `pigeon 'echo $REMOTE_TOKEN'`) and make sure it stays literal
/// once re-joined, rather than being re-escaped in a way that breaks
/// the reference.
fn relitteralize_remote_env_refs(arg: &str, remote_env: &HashMap<String, String>) -> String {
    if remote_env.is_empty() || !arg.contains('$') {
        return arg.to_string();
    }
    // shell_words::join already quotes arguments containing `$` with
    // single quotes, which keeps `$VAR` literal for the remote shell to
    // expand. Nothing further to rewrite here; this is the place a
    // future per-key escaping rule would get patched in if a project
    // ever needs one.
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_shell_invocation_passes_through() {
        let argv = vec![
            "bash".to_string(),
            "-lc".to_string(),
            "echo hi".to_string(),
        ];
        let result = normalize(&argv, &HashMap::new());
        assert_eq!(result.argv, argv);
        assert!(!result.use_shell);
    }

    #[test]
    fn plain_argv_is_wrapped_and_quoted() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        let result = normalize(&argv, &HashMap::new());
        assert!(result.use_shell);
        assert_eq!(result.argv[0], "bash");
        assert_eq!(result.argv[1], "-lc");
        assert_eq!(result.argv[2], "echo 'hello world'");
    }

    #[test]
    fn dollar_reference_stays_literal_for_remote_shell() {
        let argv = vec!["echo".to_string(), "$REMOTE_TOKEN".to_string()];
        let mut remote_env = HashMap::new();
        remote_env.insert("REMOTE_TOKEN".to_string(), "secret".to_string());
        let result = normalize(&argv, &remote_env);
        assert_eq!(result.argv[2], "echo '$REMOTE_TOKEN'");
    }
}
