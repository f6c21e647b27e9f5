use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendDialect {
    Sqlite,
    Postgresql,
    Mysql,
    Oracle,
}

/// Behavioural traits of the relational backend that change generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendProfile {
    pub dialect: BackendDialect,
    /// Later assignments of one UPDATE observe values set by earlier ones (MySQL).
    pub assignments_see_updated_values: bool,
    /// Row locks can be requested without waiting.
    pub supports_nowait: bool,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self::for_dialect(BackendDialect::Sqlite)
    }
}

impl BackendProfile {
    pub fn for_dialect(dialect: BackendDialect) -> Self {
        Self {
            dialect,
            assignments_see_updated_values: dialect == BackendDialect::Mysql,
            supports_nowait: true,
        }
    }

    /// Lock counter adjustment. Parameters: ?1 delta, ?2 now, ?3 scope, ?4 name, ?5 rse_id.
    /// The tombstone is set to now when the counter reaches zero and cleared otherwise.
    pub fn lock_counter_update_sql(&self) -> &'static str {
        if self.assignments_see_updated_values {
            "UPDATE replicas SET lock_cnt = lock_cnt + ?1, \
             tombstone = CASE WHEN lock_cnt = 0 THEN ?2 ELSE NULL END, \
             updated_at = ?2 \
             WHERE scope = ?3 AND name = ?4 AND rse_id = ?5 AND lock_cnt + ?1 >= 0"
        } else {
            "UPDATE replicas SET lock_cnt = lock_cnt + ?1, \
             tombstone = CASE WHEN lock_cnt + ?1 = 0 THEN ?2 ELSE NULL END, \
             updated_at = ?2 \
             WHERE scope = ?3 AND name = ?4 AND rse_id = ?5 AND lock_cnt + ?1 >= 0"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_counter_sql_variants() {
        let sqlite = BackendProfile::default();
        assert_eq!(sqlite.dialect, BackendDialect::Sqlite);
        assert!(sqlite
            .lock_counter_update_sql()
            .contains("CASE WHEN lock_cnt + ?1 = 0"));

        let mysql = BackendProfile::for_dialect(BackendDialect::Mysql);
        assert!(mysql.assignments_see_updated_values);
        assert!(mysql
            .lock_counter_update_sql()
            .contains("CASE WHEN lock_cnt = 0"));
    }

    #[test]
    fn test_profile_from_json() {
        let profile: BackendProfile =
            serde_json::from_str(r#"{"dialect": "oracle", "supports_nowait": false}"#).unwrap();
        assert_eq!(profile.dialect, BackendDialect::Oracle);
        assert!(!profile.supports_nowait);
        assert!(!profile.assignments_see_updated_values);
    }
}
