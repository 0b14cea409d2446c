//! sluice-core
//!
//! DB をバックエンドにしたバックグラウンドタスクキューと、その上で動く
//! イベント保持（retention）エンジン
//!
//! # モジュール構成
//! - **domain**: ID、タスクレコード、統計バケット
//! - **ports**: 抽象化レイヤー（TaskStore, StatStore, Notifier, Clock など）
//! - **typed**: 型付き Task API と TaskRegistry
//! - **impls**: ports の実装（インメモリ / SQLite / ファイル）
//! - **app**: Foreman、ワーカー、統計、enqueue クライアント、起動時ワイヤリング
//! - **retention**: irrelevance の算出と quota までの削除
//! - **config** / **error**: 設定ファイルとエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod retention;
pub mod typed;
