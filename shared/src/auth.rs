//! Verification of the access tokens the hosted auth platform issues.
//!
//! Login and token issuance stay with the platform; services only check the
//! HS256 signature and map `sub` onto the caller's `usuarios` row.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::Usuario;
use crate::schema::usuarios;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: Option<String>,
    pub role: Option<String>,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        Ok(decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims)
    }
}

/// Caller identified by a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    JwtVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("Expected: Bearer <token>".to_string()))?;

        let verifier = JwtVerifier::from_ref(state);
        let claims = verifier
            .verify(token)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

        Ok(AuthUser { user_id: claims.sub, email: claims.email })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SuperAdmin,
    Owner,
    Barber,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Owner => "owner",
            Role::Barber => "barber",
            Role::Client => "client",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Role::SuperAdmin),
            "owner" | "admin" => Ok(Role::Owner),
            "barber" => Ok(Role::Barber),
            "client" => Ok(Role::Client),
            other => Err(anyhow::anyhow!("Unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub establishment_id: Option<Uuid>,
    pub role: Role,
}

impl Caller {
    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }

    /// Owners manage their own tenant; super admins manage every tenant.
    pub fn can_manage(&self, establishment_id: Uuid) -> bool {
        self.is_super_admin() || (self.role == Role::Owner && self.establishment_id == Some(establishment_id))
    }

    /// Owners and barbers work inside their tenant.
    pub fn works_at(&self, establishment_id: Uuid) -> bool {
        self.can_manage(establishment_id)
            || (self.role == Role::Barber && self.establishment_id == Some(establishment_id))
    }

    pub fn require_manage(&self, establishment_id: Uuid) -> ApiResult<()> {
        if self.can_manage(establishment_id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Not allowed to manage this establishment".to_string()))
        }
    }

    pub fn require_super_admin(&self) -> ApiResult<()> {
        if self.is_super_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Super admin only".to_string()))
        }
    }
}

pub async fn load_caller(conn: &mut AsyncPgConnection, auth: &AuthUser) -> ApiResult<Caller> {
    let user = usuarios::table
        .find(auth.user_id)
        .first::<Usuario>(conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::Forbidden("User has no profile".to_string()))?;

    Ok(Caller {
        user_id: user.id,
        establishment_id: user.establishment_id,
        role: user.role.parse()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, exp: i64, aud: Option<&str>) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let mut claims = serde_json::json!({
            "sub": sub,
            "email": "dono@barbearia.com",
            "role": "authenticated",
            "exp": exp,
        });
        if let Some(aud) = aud {
            claims["aud"] = serde_json::Value::String(aud.to_string());
        }
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();
        (sub, token)
    }

    fn future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn verifies_platform_token() {
        let verifier = JwtVerifier::new("jwt-secret", Some("authenticated"));
        let (sub, token) = token("jwt-secret", future(), Some("authenticated"));

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, sub);
        assert_eq!(claims.email.as_deref(), Some("dono@barbearia.com"));
    }

    #[test]
    fn rejects_wrong_secret_expiry_and_audience() {
        let verifier = JwtVerifier::new("jwt-secret", Some("authenticated"));

        let (_, forged) = token("other-secret", future(), Some("authenticated"));
        assert!(verifier.verify(&forged).is_err());

        let (_, expired) = token("jwt-secret", chrono::Utc::now().timestamp() - 3600, Some("authenticated"));
        assert!(verifier.verify(&expired).is_err());

        let (_, wrong_aud) = token("jwt-secret", future(), Some("anon"));
        assert!(verifier.verify(&wrong_aud).is_err());
    }

    #[test]
    fn owners_manage_only_their_tenant() {
        let tenant = Uuid::new_v4();
        let owner = Caller { user_id: Uuid::new_v4(), establishment_id: Some(tenant), role: Role::Owner };
        let barber = Caller { role: Role::Barber, ..owner.clone() };
        let admin = Caller { user_id: Uuid::new_v4(), establishment_id: None, role: Role::SuperAdmin };

        assert!(owner.can_manage(tenant));
        assert!(!owner.can_manage(Uuid::new_v4()));
        assert!(!barber.can_manage(tenant));
        assert!(barber.works_at(tenant));
        assert!(admin.can_manage(Uuid::new_v4()));
        assert!(owner.require_super_admin().is_err());
    }
}
