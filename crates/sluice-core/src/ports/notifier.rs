//! Notifier port - producer と Foreman の間の wakeup チャネル
//!
//! wake は畳み込まれる：次の `wait` までに何回 `wake` しても保留は 1 つだけ

use std::io;

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// （寝ているかもしれない）Foreman にバックログの確認を促す
    fn wake(&self) -> io::Result<()>;

    /// wake が 1 つ以上保留されたら、それを 1 つ消費して返る
    async fn wait(&self);
}
