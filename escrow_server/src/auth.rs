//! Caller identification.
//!
//! Authentication happens upstream. The gateway in front of this server sets `X-Actor-Id` to the id of the logged-in
//! user. Operators call with `X-Admin-Key` instead, which must match the configured admin key. A request carrying an
//! admin key that does not match is rejected outright rather than downgraded to a user request.
use std::future::{ready, Ready};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use escrow_engine::order_objects::Actor;
use log::*;
use market_common::Secret;

use crate::errors::ServerError;

pub const ACTOR_ID_HEADER: &str = "X-Actor-Id";
pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Registered as app data so that the [`Caller`] extractor can check admin keys.
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub admin_key: Secret<String>,
}

impl AccessConfig {
    pub fn new<S: Into<String>>(admin_key: S) -> Self {
        Self { admin_key: Secret::new(admin_key.into()) }
    }

    /// An empty admin key disables admin access.
    pub fn is_admin_key(&self, candidate: &str) -> bool {
        !self.admin_key.is_empty() && self.admin_key.matches(candidate)
    }
}

/// The actor making the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Actor);

impl Caller {
    pub fn actor(&self) -> Actor {
        self.0
    }

    pub fn require_admin(&self) -> Result<(), ServerError> {
        match self.0 {
            Actor::Admin => Ok(()),
            other => {
                debug!("💻️ {other} tried to use an admin route");
                Err(ServerError::InsufficientPermissions("This route is restricted to operators".into()))
            },
        }
    }
}

impl FromRequest for Caller {
    type Error = ServerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(identify_caller(req))
    }
}

fn identify_caller(req: &HttpRequest) -> Result<Caller, ServerError> {
    if let Some(key) = req.headers().get(ADMIN_KEY_HEADER) {
        let key = key
            .to_str()
            .map_err(|_| ServerError::AuthenticationError(format!("{ADMIN_KEY_HEADER} is not valid text")))?;
        let valid = req.app_data::<web::Data<AccessConfig>>().map(|access| access.is_admin_key(key)).unwrap_or(false);
        if !valid {
            warn!("💻️ Rejected a request to {} with an invalid admin key", req.path());
            return Err(ServerError::AuthenticationError("Invalid admin key".into()));
        }
        return Ok(Caller(Actor::Admin));
    }
    let id = req
        .headers()
        .get(ACTOR_ID_HEADER)
        .ok_or_else(|| ServerError::AuthenticationError(format!("Missing {ACTOR_ID_HEADER} header")))?;
    let id = id
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| ServerError::AuthenticationError(format!("{ACTOR_ID_HEADER} must be a user id")))?;
    trace!("💻️ Request from user #{id}");
    Ok(Caller(Actor::User(id)))
}
