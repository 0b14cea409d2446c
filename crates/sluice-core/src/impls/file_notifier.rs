//! FileNotifier - マーカーファイルによるプロセス間 wakeup チャネル
//!
//! # 送信側
//! - 送信者ごとに wakeup ディレクトリ内のマーカーファイルを 1 つ持つ（名前は生成時の ULID）
//! - wake でファイルを作る、既にあれば（Foreman が前の wake をまだ消費していない）何も変わらない
//! - なので保留中の wake が積み上がることはない
//!
//! # 受信側
//! - ディレクトリを監視し、現れたマーカーを削除して保留 1 つに変換する

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::ports::Notifier;

pub struct FileNotifier {
    dir: PathBuf,
    marker: PathBuf,
    notify: Arc<Notify>,
    /// 受信側にだけある、drop すると監視が止まる
    _watcher: Option<RecommendedWatcher>,
}

impl FileNotifier {
    /// 送信側：`wake` のみ、送信側の `wait` は返らない
    pub fn sender(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let marker = dir.join(Ulid::new().to_string());
        Self {
            dir,
            marker,
            notify: Arc::new(Notify::new()),
            _watcher: None,
        }
    }

    /// 受信側（Foreman 用）
    ///
    /// 起動前から残っているマーカーは削除する（Foreman はどうせ起動時にバックログをさばく）
    pub fn listen(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let mut this = Self::sender(dir);
        fs::create_dir_all(&this.dir)?;

        let notify = this.notify.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_)) {
                    for path in &event.paths {
                        consume_marker(path);
                    }
                    notify.notify_one();
                }
            }
            Err(e) => warn!(error = %e, "wakeup directory watch error"),
        })
        .map_err(io::Error::other)?;
        watcher
            .watch(&this.dir, RecursiveMode::NonRecursive)
            .map_err(io::Error::other)?;

        // 監視が先、削除が後：その間に作られたマーカーは
        // 監視に拾われるかここで消えるかのどちらかで、取り残されない
        for entry in fs::read_dir(&this.dir)? {
            consume_marker(&entry?.path());
        }

        this._watcher = Some(watcher);
        Ok(this)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn consume_marker(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(marker = %path.display(), "wakeup marker consumed"),
        // 同じマーカーの前のイベントで消費済み
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(marker = %path.display(), error = %e, "could not remove wakeup marker"),
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn wake(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.marker)?;
        Ok(())
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}
