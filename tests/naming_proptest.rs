//! Property tests for branch and directory naming.

use cowai::services::worktree_service::{branch_name, sanitize};
use proptest::prelude::*;

proptest! {
    #[test]
    fn sanitized_ids_use_safe_characters(id in ".{0,200}") {
        let out = sanitize(&id);
        prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        prop_assert!(out.chars().count() <= 80);
    }

    #[test]
    fn safe_ids_are_unchanged(id in "[A-Za-z0-9._-]{1,80}") {
        prop_assert_eq!(sanitize(&id), id);
    }

    #[test]
    fn branch_names_are_namespaced(agent in "[A-Za-z0-9]{1,12}", id in ".{1,40}") {
        let branch = branch_name(&agent, &id);
        let expected_prefix = format!("agent/{agent}/");
        prop_assert!(branch.starts_with(&expected_prefix));
    }
}
