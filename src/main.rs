use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use log::info;
use serde_json::json;

use concord::config::Config;
use concord::gateway::gateway_handler;
use concord::http::api_router;
use concord::model::ids::UserId;
use concord::model::user::User;
use concord::repo::{collections, MemoryRepository, Query, Repository};
use concord::ChatState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    dev_seed(&*repo).await?;

    let state = ChatState::load(repo, config.clone()).await?;

    tokio::spawn(Arc::clone(&state).invite_janitor());

    let app = Router::new()
        .route("/", get(gateway_handler))
        .nest("/api", api_router())
        .with_state(state);

    info!("[main] listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The memory store starts empty and account registration is handled
/// outside this process, so a development token can be injected with
/// `CONCORD_DEV_TOKEN` to get a usable account on a fresh start.
async fn dev_seed(repo: &dyn Repository) -> anyhow::Result<()> {
    let Ok(token) = std::env::var("CONCORD_DEV_TOKEN") else {
        return Ok(());
    };
    let users = repo.collection(collections::USERS);
    if users.count(Query::all()).await? > 0 {
        return Ok(());
    }

    let user = User {
        id: UserId(1),
        username: "admin".into(),
        discriminator: "0001".into(),
        avatar: None,
        bot: false,
        verified: true,
        email: Some("admin@localhost".into()),
        password_hash: None,
        password_salt: None,
    };
    users.insert_one(serde_json::to_value(&user)?).await?;
    repo.collection(collections::TOKENS)
        .insert_one(json!({ "token": token, "user_id": user.id }))
        .await?;
    info!("[main] seeded dev user admin#0001");
    Ok(())
}
