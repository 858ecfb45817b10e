/// HTTP client for the document chat service.
///
/// - `client` - `ApiClient` covering auth, file, history and streaming endpoints
/// - `history` - wire records of past conversations and their conversion
///
/// # Usage
///
/// ```rust,no_run
/// use docchat::api::ApiClient;
///
/// # async fn example() -> docchat::ChatResult<()> {
/// let api = ApiClient::from_env();
/// api.login("reader@example.com", "secret").await?;
/// for file in api.list_files().await? {
///     println!("{} {}", file.file_id, file.filename);
/// }
/// # Ok(())
/// # }
/// ```
mod client;
mod history;

pub use client::ApiClient;
pub use history::{HistoryRecord, parse_timestamp};
