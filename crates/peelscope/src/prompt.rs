use std::io::{BufRead, Write};

use peelscope_core::{AuthorizationPort, FallbackRequest};

/// Asks on the terminal before every demotion.
///
/// The orchestrator calls `authorize` from async code, so the blocking read
/// runs inside `block_in_place` and needs the multi-threaded runtime.
pub struct TerminalPrompt;

impl AuthorizationPort for TerminalPrompt {
    fn authorize(&self, request: &FallbackRequest) -> bool {
        tokio::task::block_in_place(|| ask(request))
    }
}

fn ask(request: &FallbackRequest) -> bool {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(
        stderr,
        "\n{} source failed during `{}`:\n  {}",
        request.from, request.operation, request.reason
    );
    let _ = write!(
        stderr,
        "Continue with the {} source (public API)? [y/N] ",
        request.to
    );
    let _ = stderr.flush();

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(e) => {
            tracing::warn!(error = %e, "could not read fallback answer, refusing");
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_authorizes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
        assert!(!is_yes(""));
    }
}
