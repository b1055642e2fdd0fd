use crate::{
    auth::{
        auth::{AuthUser, bearer},
        jwt::{generate_access_token, generate_refresh_token, verify_token},
        password::{hash_password, verify_password},
    },
    config::Config,
    error::{AppError, AppResult, is_duplicate_key},
    model::{role::Role, user::User},
    models::{Claims, LoginReqDto, LoginResponse, RegisterReq, TokenPair, TokenType},
    utils::identity::{self, IdentityKind},
};
use actix_web::{HttpRequest, HttpResponse, web};
use sqlx::MySqlPool;
use tracing::{debug, error, info, instrument, warn};

fn token_error(e: jsonwebtoken::errors::Error) -> AppError {
    error!(error = %e, "Token signing failed");
    AppError::internal("Failed to issue token")
}

/// Issues an access/refresh pair and stores the refresh `jti`.
async fn issue_pair(
    pool: &MySqlPool,
    config: &Config,
    user_id: u64,
    username: &str,
    role_id: u8,
) -> AppResult<TokenPair> {
    let access_token =
        generate_access_token(user_id, username, role_id, &config.jwt_secret, config.access_token_ttl)
            .map_err(token_error)?;
    let (refresh_token, refresh_claims) =
        generate_refresh_token(user_id, username, role_id, &config.jwt_secret, config.refresh_token_ttl)
            .map_err(token_error)?;

    debug!(user_id, jti = %refresh_claims.jti, "Storing refresh token");
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (user_id, jti, expires_at)
        VALUES (?, ?, FROM_UNIXTIME(?))
        "#,
    )
    .bind(user_id)
    .bind(&refresh_claims.jti)
    .bind(refresh_claims.exp as i64)
    .execute(pool)
    .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
        token_type: "bearer",
    })
}

fn refresh_claims(req: &HttpRequest, config: &Config) -> Option<Claims> {
    let token = bearer(req)?;
    verify_token(token, &config.jwt_secret)
        .ok()
        .filter(|c| c.token_type == TokenType::Refresh)
}

/// Register a user
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterReq,
    responses(
        (status = 201, description = "User created", body = User),
        (status = 400, description = "Missing fields", body = Object, example = json!({"error": "Email, username, full name and password are required"})),
        (status = 409, description = "Username or e-mail taken", body = Object, example = json!({"error": "Username already taken"}))
    ),
    tag = "Auth"
)]
#[instrument(name = "auth_register", skip(pool, payload), fields(username = %payload.username))]
pub async fn register(pool: web::Data<MySqlPool>, payload: web::Json<RegisterReq>) -> AppResult<HttpResponse> {
    let req = payload.into_inner();
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_lowercase();
    let full_name = req.full_name.trim().to_string();

    if username.is_empty() || email.is_empty() || full_name.is_empty() || req.password.is_empty() {
        return Err(AppError::bad_request(
            "Email, username, full name and password are required",
        ));
    }

    if !identity::is_available(pool.get_ref(), IdentityKind::Username, &username).await {
        return Err(AppError::conflict("Username already taken"));
    }
    if !identity::is_available(pool.get_ref(), IdentityKind::Email, &email).await {
        return Err(AppError::conflict("Email already registered"));
    }

    let role = req.role.unwrap_or(Role::Employee);
    let manager_id = match (req.manager_id, role) {
        (Some(id), _) => Some(id),
        (None, Role::Hr) => None,
        (None, _) => User::first_hr(pool.get_ref()).await?.map(|hr| hr.id),
    };

    let hashed = hash_password(&req.password).map_err(|e| {
        error!(error = %e, "Password hashing failed");
        AppError::internal("Failed to register user")
    })?;

    let result = sqlx::query(
        r#"
        INSERT INTO users (email, username, full_name, password, role_id, department, position, manager_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&email)
    .bind(&username)
    .bind(&full_name)
    .bind(&hashed)
    .bind(role.id())
    .bind(req.department.as_deref())
    .bind(req.position.as_deref())
    .bind(manager_id)
    .execute(pool.get_ref())
    .await;

    let id = match result {
        Ok(done) => done.last_insert_id(),
        Err(e) if is_duplicate_key(&e) => {
            return Err(AppError::conflict("Username or email already exists"));
        }
        Err(e) => return Err(e.into()),
    };

    identity::mark_taken(IdentityKind::Username, &username).await;
    identity::mark_taken(IdentityKind::Email, &email).await;
    info!(user_id = id, role = %role, "User registered");

    let user = User::find(pool.get_ref(), id)
        .await?
        .ok_or_else(|| AppError::internal("User vanished after insert"))?;
    Ok(HttpResponse::Created().json(user))
}

/// Log in
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginReqDto,
    responses(
        (status = 200, description = "Token pair and profile", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = Object, example = json!({"error": "Invalid credentials"}))
    ),
    tag = "Auth"
)]
#[instrument(name = "auth_login", skip(pool, config, user), fields(username = %user.username))]
pub async fn login(
    user: web::Json<LoginReqDto>,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> AppResult<HttpResponse> {
    info!("Login request received");

    if user.username.trim().is_empty() || user.password.is_empty() {
        return Err(AppError::bad_request("Username and password are required"));
    }

    let Some(db_user) = User::find_by_username(pool.get_ref(), user.username.trim()).await? else {
        info!("Invalid credentials: user not found");
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    };

    if let Err(e) = verify_password(&user.password, &db_user.password) {
        info!(error = %e, "Invalid credentials: password mismatch");
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    }
    if !db_user.is_active {
        info!(user_id = db_user.id, "Login refused: account deactivated");
        return Err(AppError::Unauthorized("Account is deactivated".to_string()));
    }

    let tokens = issue_pair(pool.get_ref(), &config, db_user.id, &db_user.username, db_user.role_id).await?;

    if let Err(e) = sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = ?")
        .bind(db_user.id)
        .execute(pool.get_ref())
        .await
    {
        // Not worth failing the login over.
        warn!(error = %e, "Failed to update last_login_at");
    }

    info!(user_id = db_user.id, "Login successful");
    Ok(HttpResponse::Ok().json(LoginResponse { tokens, user: db_user }))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Invalid, revoked or expired refresh token")
    ),
    tag = "Auth",
    security(("bearer_auth" = []))
)]
#[instrument(name = "auth_refresh", skip_all)]
pub async fn refresh_token(
    req: HttpRequest,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> AppResult<HttpResponse> {
    let invalid = || AppError::Unauthorized("Invalid refresh token".to_string());
    let claims = refresh_claims(&req, &config).ok_or_else(invalid)?;

    let mut tx = pool.begin().await?;
    let revoked = sqlx::query(
        "UPDATE refresh_tokens SET revoked = TRUE WHERE jti = ? AND revoked = FALSE AND expires_at > NOW()",
    )
    .bind(&claims.jti)
    .execute(&mut *tx)
    .await?;
    if revoked.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(invalid());
    }
    tx.commit().await?;

    let user = match User::find(pool.get_ref(), claims.user_id).await? {
        Some(user) if user.is_active => user,
        _ => return Err(invalid()),
    };

    let tokens = issue_pair(pool.get_ref(), &config, user.id, &user.username, user.role_id).await?;
    debug!(user_id = user.id, "Refresh token rotated");
    Ok(HttpResponse::Ok().json(tokens))
}

/// Revoke a refresh token
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses((status = 204, description = "Logged out (idempotent)")),
    tag = "Auth",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    req: HttpRequest,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> AppResult<HttpResponse> {
    if let Some(claims) = refresh_claims(&req, &config) {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE jti = ?")
            .bind(&claims.jti)
            .execute(pool.get_ref())
            .await?;
    }
    Ok(HttpResponse::NoContent().finish())
}

/// Current user profile
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Profile of the caller", body = User),
        (status = 401, description = "Unauthorized")
    ),
    tag = "Auth",
    security(("bearer_auth" = []))
)]
pub async fn me(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    let user = auth.load(pool.get_ref()).await?;
    Ok(HttpResponse::Ok().json(user))
}
