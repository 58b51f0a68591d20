use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use syncroom_common::{Video, VideoId};

/// Resolves URLs to video identities and fetches full metadata. Lives outside
/// this core; rooms treat a failed fetch as a failed request.
#[async_trait]
pub trait InfoExtractor: Send + Sync + 'static {
    async fn resolve_url(&self, url: &str) -> Result<VideoId>;

    async fn fetch(&self, id: &VideoId) -> Result<Video>;

    async fn fetch_many(&self, ids: &[VideoId]) -> Result<Vec<Video>>;
}

/// Extractor backed by the metadata HTTP API.
pub struct HttpExtractor {
    base: String,
    http: reqwest::Client,
}

impl HttpExtractor {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InfoExtractor for HttpExtractor {
    async fn resolve_url(&self, url: &str) -> Result<VideoId> {
        Ok(self
            .http
            .get(format!("{}/data/resolve", self.base))
            .query(&[("url", url)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed resolve response")?)
    }

    async fn fetch(&self, id: &VideoId) -> Result<Video> {
        Ok(self
            .http
            .get(format!("{}/data/video/{}/{}", self.base, id.service, id.id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed video response")?)
    }

    async fn fetch_many(&self, ids: &[VideoId]) -> Result<Vec<Video>> {
        let mut videos = Vec::with_capacity(ids.len());
        for id in ids {
            videos.push(self.fetch(id).await?);
        }
        Ok(videos)
    }
}

/// Serves a fixed catalog; used by tests and offline development. URLs
/// resolve through the `service:id` shorthand.
#[derive(Default)]
pub struct FixedExtractor {
    videos: Mutex<Vec<Video>>,
}

impl FixedExtractor {
    pub fn with(videos: Vec<Video>) -> Self {
        Self {
            videos: Mutex::new(videos),
        }
    }

    pub fn insert(&self, video: Video) {
        self.videos.lock().unwrap().push(video);
    }
}

#[async_trait]
impl InfoExtractor for FixedExtractor {
    async fn resolve_url(&self, url: &str) -> Result<VideoId> {
        let Some((service, id)) = url.split_once(':') else {
            bail!("unrecognized video url {url:?}");
        };
        Ok(VideoId {
            service: service.to_owned(),
            id: id.to_owned(),
        })
    }

    async fn fetch(&self, id: &VideoId) -> Result<Video> {
        let videos = self.videos.lock().unwrap();
        match videos.iter().find(|v| v.matches(id)) {
            Some(video) => Ok(video.clone()),
            None => bail!("no such video {id}"),
        }
    }

    async fn fetch_many(&self, ids: &[VideoId]) -> Result<Vec<Video>> {
        let mut videos = Vec::with_capacity(ids.len());
        for id in ids {
            videos.push(self.fetch(id).await?);
        }
        Ok(videos)
    }
}
