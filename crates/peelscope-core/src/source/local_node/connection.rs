use std::path::Path;

use reqwest::Url;

use crate::error::CoreError;

/// Pick node credentials: explicit user/pass, else the cookie file, else none.
pub(super) fn resolve_auth(
    user: Option<&str>,
    pass: Option<&str>,
    cookie_file: Option<&Path>,
) -> Result<Option<(String, String)>, CoreError> {
    match (user, pass) {
        (Some(u), Some(p)) => return Ok(Some((u.to_owned(), p.to_owned()))),
        (Some(_), None) | (None, Some(_)) => {
            return Err(CoreError::Config(
                "node rpc user and password must be set together".to_owned(),
            ));
        }
        (None, None) => {}
    }

    let Some(cookie_file) = cookie_file else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(cookie_file).map_err(|e| {
        CoreError::Config(format!(
            "failed to read node cookie file {}: {e}",
            cookie_file.display()
        ))
    })?;
    let (cookie_user, cookie_pass) = content
        .lines()
        .next()
        .map(str::trim)
        .and_then(|line| line.split_once(':'))
        .filter(|(u, p)| !u.is_empty() && !p.is_empty())
        .ok_or_else(|| {
            CoreError::Config(format!(
                "node cookie file {} must contain non-empty `username:password`",
                cookie_file.display()
            ))
        })?;

    Ok(Some((cookie_user.to_owned(), cookie_pass.to_owned())))
}

pub(super) fn parse_node_url(url: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(url)
        .map_err(|e| CoreError::Config(format!("invalid node url `{url}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(url.to_owned()),
        other => Err(CoreError::Config(format!(
            "unsupported node url scheme `{other}`; expected http or https"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn node_url_must_be_http() {
        assert_eq!(
            parse_node_url("http://127.0.0.1:8332").expect("http is accepted"),
            "http://127.0.0.1:8332"
        );
        let err = parse_node_url("tcp://127.0.0.1:8332").expect_err("must reject tcp");
        assert!(err.to_string().contains("unsupported node url scheme"));
    }

    #[test]
    fn partial_credentials_are_rejected() {
        let err = resolve_auth(None, Some("secret"), None).expect_err("must reject");
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn explicit_credentials_win_over_cookie() {
        let missing = Path::new("/nonexistent/.cookie");
        let auth = resolve_auth(Some("alice"), Some("secret"), Some(missing))
            .expect("explicit credentials skip the cookie file");
        assert_eq!(auth, Some(("alice".to_owned(), "secret".to_owned())));
    }

    #[test]
    fn cookie_file_is_read() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time must be after unix epoch")
            .as_nanos();
        let cookie_path = std::env::temp_dir().join(format!("peelscope-cookie-{unique}.txt"));
        fs::write(&cookie_path, "__cookie__:token\n").expect("cookie file must be writable");

        let auth = resolve_auth(None, None, Some(&cookie_path)).expect("cookie must parse");
        assert_eq!(auth, Some(("__cookie__".to_owned(), "token".to_owned())));

        let _ = fs::remove_file(cookie_path);
    }

    #[test]
    fn malformed_cookie_is_rejected() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time must be after unix epoch")
            .as_nanos();
        let cookie_path = std::env::temp_dir().join(format!("peelscope-badcookie-{unique}.txt"));
        fs::write(&cookie_path, "no-separator\n").expect("cookie file must be writable");

        let err = resolve_auth(None, None, Some(&cookie_path)).expect_err("must reject");
        assert!(err.to_string().contains("username:password"));

        let _ = fs::remove_file(cookie_path);
    }
}
