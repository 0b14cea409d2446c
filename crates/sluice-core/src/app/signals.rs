//! Foreman 向けのプロセスシグナル
//!
//! - SIGINT / SIGTERM: graceful stop を要求
//! - SIGUSR1: 帯域外の wakeup
//! - 2 回目以降の SIGINT / SIGTERM も受け付けるが、期限は動かさない

use std::io;

use tokio::task::JoinHandle;
use tracing::info;

use super::foreman::ForemanHandle;

/// `handle` へのシグナル転送を開始
/// 返るタスクはランタイムが止まるか abort されるまで動く
#[cfg(unix)]
pub fn forward_signals(handle: ForemanHandle) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = interrupt.recv() => {
                    info!(signal = "SIGINT", "received signal");
                    handle.stop();
                }
                Some(()) = terminate.recv() => {
                    info!(signal = "SIGTERM", "received signal");
                    handle.stop();
                }
                Some(()) = user1.recv() => {
                    info!(signal = "SIGUSR1", "received signal");
                    handle.wake();
                }
                else => break,
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn forward_signals(handle: ForemanHandle) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "received signal");
            handle.stop();
        }
    }))
}
