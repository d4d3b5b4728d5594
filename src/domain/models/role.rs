//! Role classification for registered agents.
//!
//! Roles are resolved once, when a profile is registered. The free-text
//! label is kept as metadata only; routing looks at [`Role`].

use serde::{Deserialize, Serialize};

/// Routing role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Developer,
    TechLead,
    Pm,
    Qa,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::TechLead => "tech_lead",
            Self::Pm => "pm",
            Self::Qa => "qa",
        }
    }

    /// Classify a free-text role label.
    ///
    /// Precedence: tech lead, then PM, then QA, else developer. Short tokens
    /// such as `tl` and `pm` only match as whole words so that labels like
    /// "development" are not misread.
    pub fn classify(label: &str) -> Self {
        let lower = label.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has_word = |w: &str| words.iter().any(|candidate| *candidate == w);

        if lower.contains("tech lead")
            || lower.contains("techlead")
            || lower.contains("architect")
            || has_word("tl")
        {
            return Self::TechLead;
        }
        if lower.contains("planning") || lower.contains("product manager") || has_word("pm") {
            return Self::Pm;
        }
        if lower.contains("qa") || lower.contains("review") || lower.contains("test") {
            return Self::Qa;
        }
        Self::Developer
    }

    /// Resolve the role for a registration: explicit kind, then the PM flag,
    /// then the label.
    pub fn resolve(kind: Option<Self>, is_pm: bool, label: &str) -> Self {
        match kind {
            Some(kind) => kind,
            None if is_pm => Self::Pm,
            None => Self::classify(label),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing what an agent does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRoleProfile {
    pub agent_id: String,
    /// Free-text label, e.g. "Tech Lead" or "backend developer"
    pub role: String,
    pub kind: Role,
    #[serde(default)]
    pub is_pm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command_key: Option<String>,
}

/// Raw entry from a roles file or registration call, before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub kind: Option<Role>,
    #[serde(default)]
    pub is_pm: Option<bool>,
    #[serde(default)]
    pub focus: Option<String>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub verify_command_key: Option<String>,
}

impl From<RoleSpec> for AgentRoleProfile {
    fn from(spec: RoleSpec) -> Self {
        let is_pm = spec.is_pm.unwrap_or(false);
        let kind = Role::resolve(spec.kind, is_pm, &spec.role);
        Self {
            agent_id: spec.agent_id,
            role: spec.role,
            kind,
            is_pm,
            focus: spec.focus,
            personality: spec.personality,
            verify_command_key: spec.verify_command_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tech_lead_labels() {
        assert_eq!(Role::classify("Tech Lead"), Role::TechLead);
        assert_eq!(Role::classify("techlead"), Role::TechLead);
        assert_eq!(Role::classify("Software Architect"), Role::TechLead);
        assert_eq!(Role::classify("TL / reviewer"), Role::TechLead);
    }

    #[test]
    fn test_classify_pm_labels() {
        assert_eq!(Role::classify("planning"), Role::Pm);
        assert_eq!(Role::classify("PM"), Role::Pm);
        assert_eq!(Role::classify("Product Manager"), Role::Pm);
    }

    #[test]
    fn test_classify_word_boundaries() {
        assert_eq!(Role::classify("development"), Role::Developer);
        assert_eq!(Role::classify("settle"), Role::Developer);
        assert_eq!(Role::classify("frontend engineer"), Role::Developer);
    }

    #[test]
    fn test_classify_qa_labels() {
        assert_eq!(Role::classify("QA engineer"), Role::Qa);
        assert_eq!(Role::classify("code review"), Role::Qa);
        assert_eq!(Role::classify("tester"), Role::Qa);
    }

    #[test]
    fn test_resolve_precedence() {
        assert_eq!(Role::resolve(Some(Role::Qa), true, "tech lead"), Role::Qa);
        assert_eq!(Role::resolve(None, true, "tech lead"), Role::Pm);
        assert_eq!(Role::resolve(None, false, "tech lead"), Role::TechLead);
    }

    #[test]
    fn test_profile_from_spec() {
        let profile = AgentRoleProfile::from(RoleSpec {
            agent_id: "A".into(),
            role: "planning".into(),
            ..RoleSpec::default()
        });
        assert_eq!(profile.kind, Role::Pm);
        assert!(!profile.is_pm);
    }
}
