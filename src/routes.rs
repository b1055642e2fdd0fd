use crate::{
    api::{ai, analytics, conversation, employee, hr, manager, policy},
    auth::{handlers, middleware::auth_middleware},
    config::Config,
};
use actix_governor::{
    Governor, GovernorConfig, GovernorConfigBuilder, PeerIpKeyExtractor,
    governor::middleware::NoOpMiddleware,
};
use actix_web::{middleware::from_fn, web};
use anyhow::Context;

type LimiterConfig = GovernorConfig<PeerIpKeyExtractor, NoOpMiddleware>;

/// Per-IP limits, one quota per route group. Built once at start-up.
#[derive(Clone)]
pub struct RateLimits {
    login: LimiterConfig,
    register: LimiterConfig,
    refresh: LimiterConfig,
    protected: LimiterConfig,
}

fn limiter(requests_per_min: u32) -> anyhow::Result<LimiterConfig> {
    let requests_per_min = requests_per_min.max(1);
    GovernorConfigBuilder::default()
        .per_millisecond((60_000 / requests_per_min as u64).max(1))
        .burst_size(requests_per_min)
        .key_extractor(PeerIpKeyExtractor)
        .finish()
        .with_context(|| format!("invalid rate limit: {requests_per_min} per minute"))
}

impl RateLimits {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            login: limiter(config.rate_login_per_min)?,
            register: limiter(config.rate_register_per_min)?,
            refresh: limiter(config.rate_refresh_per_min)?,
            protected: limiter(config.rate_protected_per_min)?,
        })
    }
}

pub fn configure(cfg: &mut web::ServiceConfig, config: &Config, limits: &RateLimits) {
    // Public routes
    cfg.service(
        web::scope("/auth")
            .service(
                web::resource("/login")
                    .wrap(Governor::new(&limits.login))
                    .route(web::post().to(handlers::login)),
            )
            .service(
                web::resource("/register")
                    .wrap(Governor::new(&limits.register))
                    .route(web::post().to(handlers::register)),
            )
            .service(
                web::resource("/refresh")
                    .wrap(Governor::new(&limits.refresh))
                    .route(web::post().to(handlers::refresh_token)),
            )
            .service(
                web::resource("/logout")
                    .wrap(Governor::new(&limits.refresh))
                    .route(web::post().to(handlers::logout)),
            ),
    );

    // Protected routes
    cfg.service(
        web::scope(&config.api_prefix)
            .wrap(from_fn(auth_middleware))
            .wrap(Governor::new(&limits.protected))
            .service(web::resource("/auth/me").route(web::get().to(handlers::me)))
            .service(
                web::scope("/employees")
                    .service(
                        web::resource("/leaves")
                            .route(web::post().to(employee::create_leave))
                            .route(web::get().to(employee::list_leaves)),
                    )
                    .service(web::resource("/leaves/{id}").route(web::get().to(employee::get_leave)))
                    .service(
                        web::resource("/leaves/{id}/cancel").route(web::put().to(employee::cancel_leave)),
                    )
                    .service(web::resource("/leave-balances").route(web::get().to(employee::leave_balances))),
            )
            .service(
                web::scope("/managers")
                    .service(web::resource("/pending-leaves").route(web::get().to(manager::pending_leaves)))
                    .service(web::resource("/leaves/approve").route(web::post().to(manager::approve_leave)))
                    .service(web::resource("/team-overview").route(web::get().to(manager::team_overview)))
                    .service(web::resource("/team-calendar").route(web::get().to(manager::team_calendar)))
                    .service(web::resource("/team-insights").route(web::get().to(manager::team_insights)))
                    .service(
                        web::resource("/team-availability-forecast")
                            .route(web::get().to(manager::availability_forecast)),
                    ),
            )
            .service(
                web::scope("/hr")
                    // users
                    .service(web::resource("/users").route(web::get().to(hr::list_users)))
                    .service(web::resource("/users/{id}").route(web::get().to(hr::get_user)))
                    .service(web::resource("/users/{id}/role").route(web::put().to(hr::update_role)))
                    .service(web::resource("/users/{id}/manager").route(web::put().to(hr::update_manager)))
                    .service(web::resource("/users/{id}/activate").route(web::put().to(hr::toggle_active)))
                    .service(web::resource("/managers").route(web::get().to(hr::list_managers)))
                    // balances; static segments before /{id}
                    .service(
                        web::resource("/leave-balances")
                            .route(web::get().to(hr::list_balances))
                            .route(web::post().to(hr::create_balance)),
                    )
                    .service(web::resource("/leave-balances/bulk-create").route(web::post().to(hr::bulk_create)))
                    .service(
                        web::resource("/leave-balances/employee/{id}/reset")
                            .route(web::put().to(hr::reset_balances)),
                    )
                    .service(
                        web::resource("/leave-balances/employee/{id}/summary")
                            .route(web::get().to(hr::balance_summary)),
                    )
                    .service(
                        web::resource("/leave-balances/{id}")
                            .route(web::get().to(hr::get_balance))
                            .route(web::put().to(hr::update_balance))
                            .route(web::delete().to(hr::delete_balance)),
                    ),
            )
            .service(
                web::scope("/ai")
                    .service(web::resource("/suggest-dates").route(web::get().to(ai::suggest_dates)))
                    .service(
                        web::resource("/responsible-person-suggestions")
                            .route(web::get().to(ai::responsible_persons)),
                    ),
            )
            .service(
                web::scope("/analytics")
                    .service(web::resource("/insights").route(web::post().to(analytics::insights)))
                    .service(
                        web::resource("/department-comparison")
                            .route(web::get().to(analytics::department_comparison)),
                    )
                    .service(
                        web::resource("/burnout-indicators").route(web::get().to(analytics::burnout_indicators)),
                    )
                    .service(web::resource("/coverage-gaps").route(web::get().to(analytics::coverage_gaps))),
            )
            .service(web::resource("/conversation").route(web::post().to(conversation::converse)))
            .service(
                web::scope("/policies")
                    .service(web::resource("").route(web::get().to(policy::list_policies)))
                    .service(web::resource("/upload").route(web::post().to(policy::upload_policy)))
                    .service(web::resource("/stats").route(web::get().to(policy::policy_stats)))
                    .service(web::resource("/query").route(web::post().to(policy::query_policies)))
                    .service(web::resource("/check-compliance").route(web::post().to(policy::check_compliance)))
                    .service(web::resource("/active/{policy_type}").route(web::get().to(policy::active_policy)))
                    .service(
                        web::resource("/{id}")
                            .route(web::get().to(policy::get_policy))
                            .route(web::delete().to(policy::delete_policy)),
                    )
                    .service(web::resource("/{id}/activate").route(web::put().to(policy::activate_policy))),
            ),
    );
}

// LOGIN
//  ├─ access_token (15 min)
//  └─ refresh_token (7 days)

// API REQUEST
//  └─ Authorization: Bearer access_token

// ACCESS EXPIRED
//  └─ POST /auth/refresh with refresh_token
//       └─ returns a new pair, the old refresh token is revoked
