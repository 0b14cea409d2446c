//! 型付き ID
//!
//! すべての ID は `u64` 上の共通 `Id<T>`
//! マーカー型 `T` はコンパイル時にだけ存在し、`EventId` の位置に `TaskId` は渡せない
//! 値はエンティティを持つストアが割り当てる（SQLite の rowid、インメモリのカウンタなど）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// ID 型の表示用プレフィックスを提供するマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T: IdMarker> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub const fn get(&self) -> u64 {
        self.value
    }
}

impl<T: IdMarker> From<u64> for Id<T> {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Project {}

impl IdMarker for Project {
    fn prefix() -> &'static str {
        "project-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "event-"
    }
}

/// キュー上のタスクの ID（タスクストアが割り当て）
pub type TaskId = Id<Task>;

/// 保存イベントが quota の対象となるプロジェクトの ID
pub type ProjectId = Id<Project>;

/// 保存イベントの ID
pub type EventId = Id<Event>;

impl TaskId {
    /// ID の下 6 桁を 2 つに分けたもの（例: `004-213`）
    ///
    /// rowid 全体を出さずに、並行実行中のタスクをログ上で見分けるのに十分
    pub fn short(&self) -> String {
        let digits = format!("{:06}", self.value);
        let tail = &digits[digits.len() - 6..];
        format!("{}-{}", &tail[..3], &tail[3..])
    }
}
