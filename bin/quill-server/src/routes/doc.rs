use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme};

use crate::routes::{health, v1};

/// Name of the bearer scheme advertised when an API key is configured.
const API_KEY_SCHEME: &str = "api_key";

#[derive(OpenApi)]
#[openapi(info(
    title = "quill-server",
    description = "OpenAI-compatible chat completions with tool calling on plain text-generation engines",
    version = "0.1.0",
    contact(name = "quill", url = "https://github.com/Cyberhan123/quill")
))]
pub struct ApiDoc;

/// The merged OpenAPI document.  With `secured`, every operation requires a
/// bearer token; `/health` stays open at runtime regardless.
pub fn get_docs(secured: bool) -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(v1::api_docs());
    if secured {
        root.components.get_or_insert_with(Default::default).add_security_scheme(
            API_KEY_SCHEME,
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
        root.security = Some(vec![SecurityRequirement::new(
            API_KEY_SCHEME,
            Vec::<String>::new(),
        )]);
    }
    root
}
