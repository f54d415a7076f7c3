//! Sitemap Builder: walks visible guilds/forums/threads from the upstream
//! cabinet and streams bounded `sitemapN.xml` files plus a top-level index,
//! on a 6-hour cadence or an on-demand nudge. One `<url>` per
//! guild/forum/thread, rotating to a new file once a size or count bound is
//! reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::error::CoreResult;
use crate::upstream::Cabinet;

/// Sitemap protocol limits.
const MAX_URLS_PER_FILE: usize = 50_000;
const MAX_BYTES_PER_FILE: usize = 52_428_800;

const REGEN_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const STARTUP_DELAY: Duration = Duration::from_secs(60);

/// Owns the on-disk sitemap files and serializes regeneration.
pub struct SitemapBuilder {
    dir: PathBuf,
    public_base_url: String,
    cabinet: Arc<dyn Cabinet>,
    generating: Mutex<()>,
    nudge: mpsc::Sender<()>,
}

impl SitemapBuilder {
    /// Construct the builder and its background scheduling loop handle.
    /// Callers must `tokio::spawn` the returned future.
    pub fn new(
        dir: PathBuf,
        public_base_url: String,
        cabinet: Arc<dyn Cabinet>,
    ) -> (Arc<Self>, impl std::future::Future<Output = ()>) {
        let (tx, rx) = mpsc::channel(1);
        let builder = Arc::new(Self {
            dir,
            public_base_url,
            cabinet,
            generating: Mutex::new(()),
            nudge: tx,
        });
        let loop_fut = {
            let builder = builder.clone();
            async move { builder.run_schedule(rx).await }
        };
        (builder, loop_fut)
    }

    /// Request a regeneration at the next scheduling wake-up. Serving
    /// `/sitemap.xml` when no file exists triggers a nudge. Never blocks the
    /// caller.
    pub fn nudge(&self) {
        let _ = self.nudge.try_send(());
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("sitemap.xml")
    }

    pub fn index_exists(&self) -> bool {
        self.index_path().exists()
    }

    async fn run_schedule(&self, mut rx: mpsc::Receiver<()>) {
        tokio::time::sleep(STARTUP_DELAY).await;

        let mut ticker = tokio::time::interval(REGEN_INTERVAL);
        // The first tick fires immediately; we've already slept the
        // startup delay, so consume it without a double-generate.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = rx.recv() => {}
            }

            if self.index_is_fresh() {
                continue;
            }

            if let Err(e) = self.regenerate().await {
                tracing::warn!(error = ?e, "sitemap regeneration failed");
            }
        }
    }

    fn index_is_fresh(&self) -> bool {
        let Ok(meta) = std::fs::metadata(self.index_path()) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        modified.elapsed().map(|age| age < REGEN_INTERVAL).unwrap_or(false)
    }

    /// Regenerate all sitemap files. Single-flight: a regeneration already
    /// in progress makes this call wait for it rather than racing a second
    /// write.
    pub async fn regenerate(&self) -> CoreResult<()> {
        let _guard = self.generating.lock().await;
        tokio::fs::create_dir_all(&self.dir).await.ok();

        let mut writer = SitemapWriter::new(self.dir.clone()).await?;

        for guild in self.cabinet.guilds() {
            writer
                .push(format!("{}/guild/{}", self.public_base_url, guild))
                .await?;

            for forum in self.cabinet.visible_forums(guild) {
                writer
                    .push(format!("{}/forum/{}", self.public_base_url, forum))
                    .await?;

                let threads = self.cabinet.public_threads(forum).await?;
                for thread in threads {
                    writer
                        .push(format!("{}/post/{}", self.public_base_url, thread.id))
                        .await?;
                }
            }
        }

        let file_names = writer.finish().await?;
        self.write_index(&file_names).await?;
        Ok(())
    }

    async fn write_index(&self, file_names: &[String]) -> CoreResult<()> {
        let mut body = String::new();
        body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        body.push_str("<sitemapindex xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n");
        for name in file_names {
            body.push_str("  <sitemap><loc>");
            body.push_str(&format!("{}/sitemap/{}", self.public_base_url, name));
            body.push_str("</loc></sitemap>\n");
        }
        body.push_str("</sitemapindex>\n");

        tokio::fs::write(self.index_path(), body)
            .await
            .map_err(|e| crate::error::CoreError::StoreIo(format!("writing sitemap index: {e}")))?;
        Ok(())
    }

    pub async fn serve_sitemap_index(&self) -> CoreResult<Vec<u8>> {
        if !self.index_exists() {
            self.nudge();
        }
        tokio::fs::read(self.index_path())
            .await
            .map_err(|e| crate::error::CoreError::NotFound(format!("sitemap index not ready: {e}")))
    }

    pub async fn serve_sitemap(&self, name: &str) -> CoreResult<Vec<u8>> {
        // `name` comes straight off the URL path; reject anything that
        // could escape `self.dir`.
        if name.contains('/') || name.contains("..") {
            return Err(crate::error::CoreError::Validation("invalid sitemap file name".into()));
        }
        tokio::fs::read(self.dir.join(name))
            .await
            .map_err(|e| crate::error::CoreError::NotFound(format!("sitemap file not found: {e}")))
    }
}

/// Bounded, rotating XML writer: rolls over to a new file once the URL
/// count or byte size bound is reached.
struct SitemapWriter {
    dir: PathBuf,
    file_index: u32,
    current: Option<tokio::fs::File>,
    url_count: usize,
    byte_count: usize,
    file_names: Vec<String>,
}

const URLSET_OPEN: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n";
const URLSET_CLOSE: &str = "</urlset>\n";

impl SitemapWriter {
    async fn new(dir: PathBuf) -> CoreResult<Self> {
        let mut writer = Self {
            dir,
            file_index: 0,
            current: None,
            url_count: 0,
            byte_count: 0,
            file_names: Vec::new(),
        };
        writer.open_next_file().await?;
        Ok(writer)
    }

    fn current_name(&self) -> String {
        format!("sitemap{}.xml", self.file_index)
    }

    async fn open_next_file(&mut self) -> CoreResult<()> {
        let name = self.current_name();
        let path = self.dir.join(&name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| crate::error::CoreError::StoreIo(format!("creating {name}: {e}")))?;
        file.write_all(URLSET_OPEN.as_bytes())
            .await
            .map_err(|e| crate::error::CoreError::StoreIo(e.to_string()))?;

        self.current = Some(file);
        self.url_count = 0;
        self.byte_count = URLSET_OPEN.len();
        self.file_names.push(name);
        Ok(())
    }

    async fn close_current(&mut self) -> CoreResult<()> {
        if let Some(mut file) = self.current.take() {
            file.write_all(URLSET_CLOSE.as_bytes())
                .await
                .map_err(|e| crate::error::CoreError::StoreIo(e.to_string()))?;
            file.flush().await.map_err(|e| crate::error::CoreError::StoreIo(e.to_string()))?;
        }
        Ok(())
    }

    /// Append one `<url>` entry, rotating to the next file first if this
    /// entry would exceed either bound.
    async fn push(&mut self, loc: String) -> CoreResult<()> {
        let entry = format!("  <url><loc>{}</loc></url>\n", xml_escape(&loc));

        let would_exceed_bytes = self.byte_count + entry.len() + URLSET_CLOSE.len() > MAX_BYTES_PER_FILE;
        let would_exceed_urls = self.url_count + 1 > MAX_URLS_PER_FILE;

        if would_exceed_bytes || would_exceed_urls {
            self.close_current().await?;
            self.file_index += 1;
            self.open_next_file().await?;
        }

        let file = self.current.as_mut().expect("file opened by open_next_file");
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| crate::error::CoreError::StoreIo(e.to_string()))?;
        self.url_count += 1;
        self.byte_count += entry.len();
        Ok(())
    }

    async fn finish(mut self) -> CoreResult<Vec<String>> {
        self.close_current().await?;
        Ok(self.file_names)
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_rotates_after_url_limit() {
        let dir = std::env::temp_dir().join(format!("dfmirror-sitemap-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut writer = SitemapWriter::new(dir.clone()).await.unwrap();
        writer.url_count = MAX_URLS_PER_FILE;
        writer.push("https://example.com/post/1".into()).await.unwrap();
        let names = writer.finish().await.unwrap();

        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "sitemap0.xml");
        assert_eq!(names[1], "sitemap1.xml");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn escapes_ampersand_in_urls() {
        assert_eq!(xml_escape("https://x.com/a?b=1&c=2"), "https://x.com/a?b=1&amp;c=2");
    }
}
