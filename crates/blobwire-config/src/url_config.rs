//! URL-scoped configuration lookup (`<prefix>.<url>.<key>`).
//!
//! # Design
//! - Scheme and port must match exactly; the most specific host wins, then
//!   the longest path prefix, then an exact username match.
//! - A search path shaped like `x.git/info/lfs` also matches a configured `x`
//!   at a lower score than a literal `x.git` element.
//! - The bare `<prefix>.<key>` value is the fallback.

use url::Url;

use crate::map::{ConfigMap, parse_bool};

/// Placeholder substituted for `*` host labels so wildcard keys parse as URLs.
const WILDCARD_LABEL: &str = "x--wildcard--x";

/// Read-only view that resolves URL-scoped git configuration keys.
#[derive(Debug, Clone, Copy)]
pub struct UrlConfig<'a> {
    git: &'a ConfigMap,
}

#[derive(Debug, Default, Clone, Copy)]
struct Score {
    host: usize,
    path: usize,
    user: usize,
}

impl<'a> UrlConfig<'a> {
    /// Wrap a git configuration snapshot.
    #[must_use]
    pub const fn new(git: &'a ConfigMap) -> Self {
        Self { git }
    }

    /// Last value of the best `<prefix>.<url>.<key>` match for `raw_url`.
    #[must_use]
    pub fn get(&self, prefix: &str, raw_url: &str, key: &str) -> Option<&'a str> {
        self.get_all(prefix, raw_url, key)
            .last()
            .map(String::as_str)
    }

    /// Every value of the best `<prefix>.<url>.<key>` match for `raw_url`.
    #[must_use]
    pub fn get_all(&self, prefix: &str, raw_url: &str, key: &str) -> &'a [String] {
        let prefix = prefix.to_ascii_lowercase();
        let key = key.to_ascii_lowercase();
        if let Some(best) = self.best_match(&prefix, raw_url, &key) {
            let values = self.git.get_all(best);
            if !values.is_empty() {
                return values;
            }
        }
        self.git.get_all(&format!("{prefix}.{key}"))
    }

    /// Boolean value of the best match using git's truthiness rules.
    #[must_use]
    pub fn bool(&self, prefix: &str, raw_url: &str, key: &str, default: bool) -> bool {
        parse_bool(self.get(prefix, raw_url, key).unwrap_or_default(), default)
    }

    fn best_match(&self, prefix: &str, raw_url: &str, key: &str) -> Option<&'a str> {
        let search = Url::parse(raw_url).ok()?;
        let head = format!("{prefix}.");
        let tail = format!(".{key}");

        let mut best: Option<(&'a str, Score)> = None;
        for (config_key, _) in self.git.iter() {
            let Some(candidate) = config_key
                .strip_prefix(&head)
                .and_then(|rest| rest.strip_suffix(&tail))
            else {
                continue;
            };
            if candidate.is_empty() || candidate.contains(char::is_whitespace) {
                continue;
            }
            let Some(configured) = parse_config_url(candidate) else {
                continue;
            };
            let Some(score) = score_match(&search, &configured) else {
                continue;
            };

            let better = match best {
                None => true,
                Some((_, current)) => {
                    score.host > current.host
                        || (score.host == current.host
                            && (score.path > current.path
                                || (score.path == current.path && score.user > current.user)))
                }
            };
            if better {
                best = Some((config_key, score));
            }
        }
        best.map(|(config_key, _)| config_key)
    }
}

fn parse_config_url(candidate: &str) -> Option<Url> {
    let (scheme, rest) = candidate.split_once("://")?;
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((user, host)) => (Some(user), host),
        None => (None, authority),
    };
    let host_port = host_port
        .split('.')
        .map(|label| if label == "*" { WILDCARD_LABEL } else { label })
        .collect::<Vec<_>>()
        .join(".");
    let rebuilt = match userinfo {
        Some(user) => format!("{scheme}://{user}@{host_port}{path}"),
        None => format!("{scheme}://{host_port}{path}"),
    };
    Url::parse(&rebuilt).ok()
}

fn score_match(search: &Url, configured: &Url) -> Option<Score> {
    if search.scheme() != configured.scheme() {
        return None;
    }

    let host = compare_hosts(search.host_str()?, configured.host_str()?);
    if host == 0 {
        return None;
    }

    if port_for(search) != port_for(configured) {
        return None;
    }

    let path = compare_paths(search.path(), configured.path());
    if path == 0 {
        return None;
    }

    let mut user = 0;
    if !configured.username().is_empty() {
        if search.username() != configured.username() {
            return None;
        }
        user = 1;
    }

    Some(Score { host, path, user })
}

fn port_for(url: &Url) -> Option<u16> {
    url.port().or_else(|| match url.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        "ssh" => Some(22),
        _ => None,
    })
}

fn compare_hosts(search: &str, configured: &str) -> usize {
    let search: Vec<&str> = search.split('.').collect();
    let configured: Vec<&str> = configured.split('.').collect();
    if search.len() != configured.len() {
        return 0;
    }

    let mut score = search.len() + 1;
    for (label, pattern) in search.iter().zip(&configured) {
        if *pattern == WILDCARD_LABEL {
            score -= 1;
            continue;
        }
        if label != pattern {
            return 0;
        }
    }
    score
}

fn compare_paths(search: &str, configured: &str) -> usize {
    let search: Vec<&str> = search.split('/').filter(|part| !part.is_empty()).collect();
    let configured: Vec<&str> = configured
        .split('/')
        .filter(|part| !part.is_empty())
        .collect();
    if search.len() < configured.len() {
        return 0;
    }

    let mut score = 1;
    for (index, element) in configured.iter().enumerate() {
        let searched = search[index];
        if searched == *element {
            score += 2;
            continue;
        }
        if is_default_lfs_path(&search, index)
            && searched.strip_suffix(".git") == Some(*element)
        {
            score += 1;
            continue;
        }
        return 0;
    }
    score
}

fn is_default_lfs_path(parts: &[&str], index: usize) -> bool {
    parts[index].len() > 4
        && parts[index].ends_with(".git")
        && parts.get(index + 1) == Some(&"info")
        && parts.get(index + 2) == Some(&"lfs")
}
