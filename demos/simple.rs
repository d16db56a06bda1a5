use std::env;
use std::time::Duration;

use dir_monitor::Watcher;
use futures_util::StreamExt;
use log::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    pretty_env_logger::init();

    let watcher = Watcher::builder()
        .latency(Duration::from_millis(100))
        .build();
    let dirs: Vec<_> = env::args().skip(1).collect();
    let dirs = if dirs.is_empty() {
        vec![String::from("./")]
    } else {
        dirs
    };
    for dir in &dirs {
        if let Err(e) = watcher.add_directory(dir) {
            error!("{}", e);
            return;
        }
    }
    info!("Watching {:?}", watcher.directories());

    let mut events = Box::pin(watcher.events());
    while let Some(event) = events.next().await {
        info!("{}", event);
    }
}
