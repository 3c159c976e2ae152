//! Platform/channel → session routing.

use serde::Deserialize;

use crate::config::MAIN_SESSION;

/// Fields a routing rule matches on. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteMatch {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl RouteMatch {
    pub fn matches(&self, platform: &str, channel: &str) -> bool {
        self.platform.as_deref().is_none_or(|p| p == platform)
            && self.channel.as_deref().is_none_or(|c| c == channel)
    }
}

/// One ordered routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "match", default)]
    pub matcher: RouteMatch,
    pub session: String,
}

impl RoutingRule {
    pub fn new(matcher: RouteMatch, session: impl Into<String>) -> Self {
        Self {
            matcher,
            session: session.into(),
        }
    }
}

/// Resolves incoming messages to session names. First matching rule wins.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RoutingRule>,
    default_session: String,
}

impl Router {
    pub fn new(rules: Vec<RoutingRule>, default_session: Option<String>) -> Self {
        Self {
            rules,
            default_session: default_session.unwrap_or_else(|| MAIN_SESSION.to_string()),
        }
    }

    pub fn default_session(&self) -> &str {
        &self.default_session
    }

    pub fn resolve(&self, platform: &str, channel: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(platform, channel))
            .map_or(self.default_session.as_str(), |rule| rule.session.as_str())
    }
    /// Default and rule targets that aren't in `declared`, each listed once.
    pub fn unknown_targets(&self, declared: &[String]) -> Vec<&str> {
        let mut unknown: Vec<&str> = Vec::new();
        let targets = std::iter::once(self.default_session.as_str())
            .chain(self.rules.iter().map(|rule| rule.session.as_str()));
        for target in targets {
            if !declared.iter().any(|name| name == target) && !unknown.contains(&target) {
                unknown.push(target);
            }
        }
        unknown
    }
}
