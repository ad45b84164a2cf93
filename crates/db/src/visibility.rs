use sqlx::{QueryBuilder, Sqlite};

/// Environments visible when running without a commercial licence.
pub const OSS_ENVIRONMENTS: [&str; 3] = ["default", "development", "production"];

/// Which environments the stores expose. Applied uniformly by every read
/// that returns environment-scoped rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VisibilityPolicy {
    #[default]
    Unrestricted,
    Oss,
}

impl VisibilityPolicy {
    pub fn from_oss_flag(is_oss: bool) -> Self {
        if is_oss {
            VisibilityPolicy::Oss
        } else {
            VisibilityPolicy::Unrestricted
        }
    }

    pub fn allows(&self, environment: &str) -> bool {
        match self {
            VisibilityPolicy::Unrestricted => true,
            VisibilityPolicy::Oss => OSS_ENVIRONMENTS.contains(&environment),
        }
    }

    /// Append ` AND <column> IN (...)` when the policy restricts environments.
    /// The query must already be inside a `WHERE` or `ON` clause.
    pub fn scope_environments<'args>(&self, query: &mut QueryBuilder<'args, Sqlite>, column: &str) {
        if let VisibilityPolicy::Oss = self {
            query.push(" AND ").push(column).push(" IN (");
            let mut names = query.separated(", ");
            for name in OSS_ENVIRONMENTS {
                names.push_bind(name);
            }
            query.push(")");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oss_allows_only_fixed_names() {
        let policy = VisibilityPolicy::from_oss_flag(true);
        assert!(policy.allows("production"));
        assert!(!policy.allows("staging"));
        assert!(VisibilityPolicy::Unrestricted.allows("staging"));
    }

    #[test]
    fn unrestricted_leaves_query_untouched() {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT name FROM environments WHERE 1 = 1");
        VisibilityPolicy::Unrestricted.scope_environments(&mut query, "name");
        assert_eq!(query.sql(), "SELECT name FROM environments WHERE 1 = 1");
    }

    #[test]
    fn oss_appends_in_list() {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT name FROM environments e WHERE 1 = 1");
        VisibilityPolicy::Oss.scope_environments(&mut query, "e.name");
        assert_eq!(
            query.sql(),
            "SELECT name FROM environments e WHERE 1 = 1 AND e.name IN (?, ?, ?)"
        );
    }
}
