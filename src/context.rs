//! Request-scoped tenant context.
//!
//! Resolved by the external auth front door and threaded explicitly through
//! the pipeline — no ambient or task-local state.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identity and attribution for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub org_id: Uuid,
    pub app_id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl TenantContext {
    pub fn new(org_id: Uuid, app_id: Uuid, user_id: Option<Uuid>) -> Self {
        Self {
            org_id,
            app_id,
            user_id,
            request_id: Uuid::new_v4(),
            ip: None,
            user_agent: None,
            received_at: Utc::now(),
        }
    }

    /// Canonical bucket key for the full request scope:
    /// `org:<id>:app:<id>[:user:<id>]`.
    pub fn scope_key(&self) -> String {
        match self.user_id {
            Some(user) => format!("org:{}:app:{}:user:{}", self.org_id, self.app_id, user),
            None => format!("org:{}:app:{}", self.org_id, self.app_id),
        }
    }

    /// Bucket key for a policy's own scope: a policy with null `app_id`
    /// buckets org-wide, one with null `user_id` buckets per-app. The key
    /// identifies *requests in scope*, not the policy, so two policies with
    /// the same scope share one admission log.
    pub fn scope_key_for(&self, policy_app: Option<Uuid>, policy_user: Option<Uuid>) -> String {
        match (policy_app, policy_user) {
            (None, _) => format!("org:{}", self.org_id),
            (Some(app), None) => format!("org:{}:app:{}", self.org_id, app),
            (Some(app), Some(user)) => format!("org:{}:app:{}:user:{}", self.org_id, app, user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_without_user() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let ctx = TenantContext::new(org, app, None);
        assert_eq!(ctx.scope_key(), format!("org:{}:app:{}", org, app));
    }

    #[test]
    fn test_scope_key_with_user() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let user = Uuid::new_v4();
        let ctx = TenantContext::new(org, app, Some(user));
        assert_eq!(
            ctx.scope_key(),
            format!("org:{}:app:{}:user:{}", org, app, user)
        );
    }

    #[test]
    fn test_scope_key_for_policy_scopes() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let user = Uuid::new_v4();
        let ctx = TenantContext::new(org, app, Some(user));

        // Org-wide policy buckets on the org alone.
        assert_eq!(ctx.scope_key_for(None, None), format!("org:{}", org));
        // App-scoped policy buckets per app.
        assert_eq!(
            ctx.scope_key_for(Some(app), None),
            format!("org:{}:app:{}", org, app)
        );
        // User-scoped policy buckets per user.
        assert_eq!(
            ctx.scope_key_for(Some(app), Some(user)),
            format!("org:{}:app:{}:user:{}", org, app, user)
        );
    }

    #[test]
    fn test_request_ids_are_unique() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let a = TenantContext::new(org, app, None);
        let b = TenantContext::new(org, app, None);
        assert_ne!(a.request_id, b.request_id);
    }
}
