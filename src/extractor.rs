use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct Claims {
    sub: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated caller resolved from the session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

fn session_token(parts: &Parts) -> Option<String> {
    if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
        let cookies = cookie_header.to_str().unwrap_or("");
        let token = cookies.split(';').find_map(|c| {
            let c = c.trim();
            c.strip_prefix("auth_token=").map(|s| s.to_string())
        });
        if token.is_some() {
            return token;
        }
    }
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|authz| authz.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = session_token(parts).ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(user_id: Uuid) -> String {
        let claims = serde_json::json!({
            "sub": user_id,
            "email": "owner@example.com",
            "exp": 9999999999u64
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn token_parsed_from_header() {
        std::env::set_var("JWT_SECRET", "secret");
        let user_id = Uuid::new_v4();
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", token_for(user_id)))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("owner@example.com"));
    }

    #[tokio::test]
    async fn token_parsed_from_cookie() {
        std::env::set_var("JWT_SECRET", "secret");
        let user_id = Uuid::new_v4();
        let request = Request::builder()
            .header("Cookie", format!("theme=dark; auth_token={}", token_for(user_id)))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.user_id, user_id);
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        std::env::set_var("JWT_SECRET", "secret");
        let request = Request::builder()
            .header("Authorization", "Bearer invalid")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let res = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(res.is_err());
    }
}
