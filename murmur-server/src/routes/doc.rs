use utoipa::OpenApi;

use super::{health, pool, tasks};

#[derive(OpenApi)]
#[openapi(info(
    title = "murmur-server",
    description = "Asynchronous speech-to-text transcription API",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(pool::PoolApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root
}
