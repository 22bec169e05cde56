//! Video catalog
//!
//! Published videos and their authors, persisted in SQLite. Wallet addresses are
//! stored lower-cased; a user row is created on first publish and deleting it
//! removes the user's videos.

pub mod store;

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::upload::UploadResult;

pub use store::CatalogStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct UserRecord {
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub video_commp: String,
    pub thumbnail_commp: String,
    pub wallet_address: String,
    pub category: String,
    /// RFC 3339 UTC timestamp with milliseconds
    #[serde(rename = "uploaded_at")]
    #[sqlx(rename = "uploaded_at")]
    pub uploaded_at: String,
    pub views: i64,
    pub likes: i64,
    pub dislikes: i64,
    /// Seconds
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserInput {
    #[validate(length(min = 1, message = "Wallet address is required"))]
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateVideoInput {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(length(min = 1, message = "Video URL is required"))]
    pub video_commp: String,
    #[validate(length(min = 1, message = "Thumbnail URL is required"))]
    pub thumbnail_commp: String,
    #[validate(length(min = 1, message = "Author address is required"))]
    pub author_address: String,
    #[validate(length(min = 1, message = "Category is required"))]
    pub category: String,
}

impl CreateUserInput {
    /// Trim and lower-case the address, then validate
    pub fn normalized(mut self) -> Result<Self> {
        self.wallet_address = normalize_address(&self.wallet_address);
        self.validate()?;
        Ok(self)
    }
}

impl CreateVideoInput {
    /// Publish payload for a finished video and thumbnail upload
    pub fn from_uploads(
        title: impl Into<String>,
        description: Option<String>,
        category: impl Into<String>,
        author_address: &str,
        video: &UploadResult,
        thumbnail: &UploadResult,
    ) -> Self {
        Self {
            title: title.into(),
            description,
            video_commp: video.commp.clone(),
            thumbnail_commp: thumbnail.commp.clone(),
            author_address: author_address.to_string(),
            category: category.into(),
        }
    }

    /// Trim every field, lower-case the author, then validate.
    ///
    /// Whitespace-only values count as missing.
    pub fn normalized(mut self) -> Result<Self> {
        self.title = self.title.trim().to_string();
        self.description = self.description.map(|d| d.trim().to_string());
        self.video_commp = self.video_commp.trim().to_string();
        self.thumbnail_commp = self.thumbnail_commp.trim().to_string();
        self.author_address = normalize_address(&self.author_address);
        self.category = self.category.trim().to_string();
        self.validate()?;
        Ok(self)
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

const ID_LEN: usize = 24;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Collision-resistant id: 24 lower-case alphanumerics, starting with a letter
pub fn new_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(ID_LEN);
    id.push(ALPHABET[rng.gen_range(0..26)] as char);
    for _ in 1..ID_LEN {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}
