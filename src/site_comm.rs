use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use log::{error, trace};
use parking_lot::Mutex;
use crate::config::Configuration;

/// Outbound channel to the companion site: batches of expired token pairs
/// are reported through `tools.php` so the site can release the slots.
pub struct SiteComm {
    site_host: String,
    site_path: String,
    site_password: String,
    readonly: bool,
    client: reqwest::Client,
    pub expire_token_buffer: Mutex<String>,
    pub token_queue: Mutex<VecDeque<String>>,
    t_active: AtomicBool,
}

impl SiteComm {
    pub fn new(config: &Arc<Configuration>) -> SiteComm {
        SiteComm {
            site_host: config.tracker.site_host.clone(),
            site_path: config.tracker.site_path.clone(),
            site_password: config.tracker.site_password.clone(),
            readonly: config.tracker.readonly,
            client: reqwest::Client::new(),
            expire_token_buffer: Mutex::new(String::new()),
            token_queue: Mutex::new(VecDeque::new()),
            t_active: AtomicBool::new(false),
        }
    }

    pub fn all_clear(&self) -> bool {
        self.token_queue.lock().is_empty()
    }

    /// Queues a `user:torrent` pair. An overlong buffer is promoted to the
    /// queue immediately instead of waiting for the next scheduler tick.
    pub fn expire_token(self: &Arc<Self>, torrent_id: u32, user_id: u32) {
        let mut buffer = self.expire_token_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(format!("{}:{}", user_id, torrent_id).as_str());
        if buffer.len() > 350 {
            error!("Flushing overloaded token buffer");
            if !self.readonly {
                self.token_queue.lock().push_back(buffer.clone());
            }
            buffer.clear();
        }
    }

    pub fn flush_tokens(self: &Arc<Self>) {
        if self.readonly {
            self.expire_token_buffer.lock().clear();
            return;
        }
        let mut queue = self.token_queue.lock();
        if !queue.is_empty() {
            trace!("Token expire queue size: {}", queue.len());
        }
        let mut buffer = self.expire_token_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        queue.push_back(buffer.clone());
        buffer.clear();
        drop(buffer);
        drop(queue);
        if self.t_active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let site_comm = self.clone();
            tokio::spawn(async move {
                site_comm.do_flush_tokens().await;
            });
        }
    }

    /// A batch only leaves the queue once the site answered 200.
    async fn do_flush_tokens(self: Arc<Self>) {
        loop {
            let tokens = match self.token_queue.lock().front() {
                Some(front) => front.clone(),
                None => break,
            };
            let url = format!(
                "http://{}{}/tools.php?key={}&type=expiretoken&action=radiance&tokens={}",
                self.site_host, self.site_path, self.site_password, tokens
            );
            match self.client.get(url.as_str()).send().await {
                Ok(response) => {
                    if response.status().as_u16() == 200 {
                        self.token_queue.lock().pop_front();
                        continue;
                    }
                    error!("Response returned with status code {} when trying to expire a token!", response.status().as_u16());
                }
                Err(err) => {
                    error!("Exception: {}", err);
                }
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.t_active.store(false, Ordering::Release);
    }
}
