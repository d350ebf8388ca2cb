//! Caller identity.
//!
//! Authentication happens upstream (gateway or reverse proxy), which forwards
//! the verified user id in `x-user-id` and roles in `x-user-roles`. Handlers
//! trust these headers unconditionally.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const ADMIN_ROLE: &str = "admin";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub roles: Vec<String>,
}

impl AuthenticatedUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    fn from_parts(parts: &Parts) -> Result<Self, ServiceError> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("missing authenticated user".to_string()))?;
        let user_id = raw
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ServiceError::Unauthorized("invalid user id".to_string()))?;
        let roles = parts
            .headers
            .get(USER_ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { user_id, roles })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts)
    }
}

/// An authenticated caller carrying the admin role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminUser(pub AuthenticatedUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_parts(parts)?;
        if !user.has_role(ADMIN_ROLE) {
            return Err(ServiceError::Forbidden("admin role required".to_string()));
        }
        Ok(Self(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn extracts_user_and_roles() {
        let mut p = parts(&[(USER_ID_HEADER, "42"), (USER_ROLES_HEADER, "buyer, Admin")]);
        let user = AuthenticatedUser::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(user.user_id, 42);
        assert!(user.has_role("admin"));
        assert!(AdminUser::from_request_parts(&mut p, &()).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_missing_or_invalid_user() {
        let mut missing = parts(&[]);
        assert_matches!(
            AuthenticatedUser::from_request_parts(&mut missing, &()).await,
            Err(ServiceError::Unauthorized(_))
        );
        let mut invalid = parts(&[(USER_ID_HEADER, "abc")]);
        assert_matches!(
            AuthenticatedUser::from_request_parts(&mut invalid, &()).await,
            Err(ServiceError::Unauthorized(_))
        );
        let mut buyer = parts(&[(USER_ID_HEADER, "7")]);
        assert_matches!(
            AdminUser::from_request_parts(&mut buyer, &()).await,
            Err(ServiceError::Forbidden(_))
        );
    }
}
