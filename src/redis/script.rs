use crate::errors::{RateLimitError, Result};
use redis::aio::ConnectionLike;
use redis::Script;
use tracing::{debug, info};

const TOKEN_BUCKET_LUA: &str = include_str!("../../scripts/token_bucket.lua");

/// Register the token bucket script so the first consume can use EVALSHA.
pub async fn load_script<C: ConnectionLike>(conn: &mut C) -> Result<String> {
    debug!("Loading token bucket Lua script into Redis...");

    let sha = get_script()
        .prepare_invoke()
        .load_async(conn)
        .await
        .map_err(RateLimitError::RedisConnectionError)?;

    info!("Token bucket script loaded (SHA: {})", sha);
    Ok(sha)
}

/// Script handle; invocation falls back to EVAL if the server lost the SHA.
pub fn get_script() -> Script {
    Script::new(TOKEN_BUCKET_LUA)
}
