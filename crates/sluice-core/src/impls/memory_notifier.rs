//! MemoryNotifier - プロセス内 wakeup チャネル

use std::io;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ports::Notifier;

/// `Notify` が保持する permit は最大 1 つ、wakeup チャネルに必要な畳み込みそのもの
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notify: Notify,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn wake(&self) -> io::Result<()> {
        self.notify.notify_one();
        Ok(())
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}
