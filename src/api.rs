//! HTTP surface: the WebSocket upgrade plus the project REST endpoints.
//!
//! Every route authenticates through the same filter. Handler failures
//! become [`ApiError`] rejections, and [`handle_rejection`] turns those into
//! JSON error bodies with a matching status code.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::analytics::user_analytics;
use crate::error::{Classify, ErrorBody, ErrorKind};
use crate::gateway::Gateway;
use crate::identity::{authenticate, credential_from, IdentityVerifier, UserIdentity};
use crate::membership::MembershipAuthority;
use crate::models::{NewProject, ProjectStatus, ProjectUpdate};

pub struct AppContext {
    pub authority: Arc<MembershipAuthority>,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub handshake_timeout: Duration,
}

type Ctx = Arc<AppContext>;

#[derive(Debug)]
pub struct ApiError(pub ErrorBody);

impl warp::reject::Reject for ApiError {}

fn reject<E: Classify>(err: E) -> Rejection {
    warp::reject::custom(ApiError(ErrorBody::from_error(&err)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectBody {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProjectBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetUserBody {
    user_id: String,
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

fn parse_status(status: Option<&str>) -> Result<Option<ProjectStatus>, Rejection> {
    status.map(str::parse::<ProjectStatus>).transpose().map_err(reject)
}

fn with_ctx(ctx: Ctx) -> impl Filter<Extract = (Ctx,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&ctx))
}

fn authenticated(ctx: Ctx) -> impl Filter<Extract = (UserIdentity,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::query::<HashMap<String, String>>())
        .and(with_ctx(ctx))
        .and_then(
            |header: Option<String>, query: HashMap<String, String>, ctx: Ctx| async move {
                let credential =
                    credential_from(header.as_deref(), query.get("token").map(String::as_str));
                authenticate(&ctx.verifier, credential, ctx.handshake_timeout)
                    .await
                    .map_err(reject)
            },
        )
}

pub fn routes(ctx: Ctx) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let auth = authenticated(Arc::clone(&ctx));
    let ctx = with_ctx(ctx);

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(auth.clone())
        .and(ctx.clone())
        .map(|ws: warp::ws::Ws, identity: UserIdentity, ctx: Ctx| {
            let gateway = Arc::clone(&ctx.gateway);
            ws.on_upgrade(move |socket| gateway.handle_connection(socket, identity))
        });

    let create = warp::post()
        .and(warp::path!("api" / "projects"))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(create_project);

    let list = warp::get()
        .and(warp::path!("api" / "projects"))
        .and(auth.clone())
        .and(ctx.clone())
        .and_then(list_projects);

    let get = warp::get()
        .and(warp::path!("api" / "projects" / String))
        .and(auth.clone())
        .and(ctx.clone())
        .and_then(get_project);

    let join = warp::post()
        .and(warp::path!("api" / "projects" / String / "join"))
        .and(auth.clone())
        .and(ctx.clone())
        .and_then(request_join);

    let accept = warp::post()
        .and(warp::path!("api" / "projects" / String / "accept-invite"))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(accept_invite);

    let promote = warp::post()
        .and(warp::path!("api" / "projects" / String / "make-admin"))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(promote_admin);

    let demote = warp::post()
        .and(warp::path!("api" / "projects" / String / "demote-admin"))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(demote_admin);

    let update = warp::put()
        .and(warp::path!("api" / "projects" / String))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(update_project);

    let status = warp::put()
        .and(warp::path!("api" / "projects" / String / "status"))
        .and(auth.clone())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(update_status);

    let history = warp::get()
        .and(warp::path!("api" / "messages" / String))
        .and(auth.clone())
        .and(ctx.clone())
        .and_then(message_history);

    let analytics = warp::get()
        .and(warp::path!("api" / "analytics" / "user"))
        .and(auth)
        .and(ctx)
        .and_then(user_stats);

    ws.or(create)
        .or(list)
        .or(get)
        .or(join)
        .or(accept)
        .or(promote)
        .or(demote)
        .or(update)
        .or(status)
        .or(history)
        .or(analytics)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT"])
                .allow_headers(vec!["authorization", "content-type"]),
        )
        .recover(handle_rejection)
}

async fn create_project(
    identity: UserIdentity,
    body: CreateProjectBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let details = NewProject {
        title: body.title,
        description: body.description,
        status: parse_status(body.status.as_deref())?,
    };
    let project = ctx
        .authority
        .create_project(&identity.user_id, details)
        .await
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&project),
        StatusCode::CREATED,
    ))
}

async fn list_projects(_identity: UserIdentity, ctx: Ctx) -> Result<impl Reply, Rejection> {
    let projects = ctx.authority.list_projects().await.map_err(reject)?;
    Ok(warp::reply::json(&projects))
}

async fn get_project(id: String, _identity: UserIdentity, ctx: Ctx) -> Result<impl Reply, Rejection> {
    let project = ctx.authority.get_project(&id).await.map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn request_join(id: String, identity: UserIdentity, ctx: Ctx) -> Result<impl Reply, Rejection> {
    let project = ctx
        .authority
        .request_join(&id, &identity.user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn accept_invite(
    id: String,
    identity: UserIdentity,
    body: TargetUserBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let project = ctx
        .authority
        .accept_invite(&id, &identity.user_id, &body.user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn promote_admin(
    id: String,
    identity: UserIdentity,
    body: TargetUserBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let project = ctx
        .authority
        .promote_admin(&id, &identity.user_id, &body.user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn demote_admin(
    id: String,
    identity: UserIdentity,
    body: TargetUserBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let project = ctx
        .authority
        .demote_admin(&id, &identity.user_id, &body.user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn update_project(
    id: String,
    identity: UserIdentity,
    body: UpdateProjectBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let update = ProjectUpdate {
        title: body.title,
        description: body.description,
        status: parse_status(body.status.as_deref())?,
    };
    let project = ctx
        .authority
        .update_project(&id, &identity.user_id, update)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn update_status(
    id: String,
    identity: UserIdentity,
    body: StatusBody,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let status = body.status.parse::<ProjectStatus>().map_err(reject)?;
    let project = ctx
        .authority
        .update_status(&id, &identity.user_id, status)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&project))
}

async fn message_history(
    project_id: String,
    identity: UserIdentity,
    ctx: Ctx,
) -> Result<impl Reply, Rejection> {
    let messages = ctx
        .gateway
        .history(&identity, &project_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&messages))
}

async fn user_stats(identity: UserIdentity, ctx: Ctx) -> Result<impl Reply, Rejection> {
    let projects = ctx.authority.list_projects().await.map_err(reject)?;
    Ok(warp::reply::json(&user_analytics(&projects, &identity.user_id)))
}

fn plain_error(kind: ErrorKind, code: &str, message: String) -> ErrorBody {
    ErrorBody {
        kind,
        code: code.to_string(),
        message,
        project_id: None,
        user_id: None,
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(ApiError(body)) = err.find::<ApiError>() {
        (body.kind.status_code(), body.clone())
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            plain_error(ErrorKind::NotFound, "RouteNotFound", "no such route".into()),
        )
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            plain_error(ErrorKind::Validation, "InvalidBody", e.to_string()),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            plain_error(ErrorKind::Validation, "MethodNotAllowed", "method not allowed".into()),
        )
    } else {
        debug!("Unhandled rejection: {:?}", err);
        (
            StatusCode::BAD_REQUEST,
            plain_error(ErrorKind::Validation, "BadRequest", format!("{err:?}")),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
