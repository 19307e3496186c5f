use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use smart_backup_core::{NotificationSink, ProgressSink};
use tracing::{debug, info};

const MAX_NOTICES: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub message: String,
    pub fraction: f64,
}

#[derive(Debug)]
struct Board {
    message: String,
    fraction: f64,
    notices: VecDeque<Notice>,
}

/// Latest progress line plus a bounded history of notifications, readable over the API.
#[derive(Debug)]
pub struct StatusBoard {
    inner: Mutex<Board>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Board {
                message: "Ready".to_owned(),
                fraction: 0.0,
                notices: VecDeque::new(),
            }),
        }
    }
}

impl StatusBoard {
    fn board(&self) -> MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> StatusSnapshot {
        let board = self.board();
        StatusSnapshot {
            message: board.message.clone(),
            fraction: board.fraction,
        }
    }

    /// Newest last.
    pub fn notices(&self) -> Vec<Notice> {
        self.board().notices.iter().cloned().collect()
    }

    pub fn reset_progress(&self) {
        self.board().fraction = 0.0;
    }
}

impl ProgressSink for StatusBoard {
    fn update(&self, message: &str, fraction: f64) {
        debug!(%message, fraction, "progress");
        let mut board = self.board();
        board.message = message.to_owned();
        board.fraction = fraction.clamp(0.0, 1.0);
    }
}

impl NotificationSink for StatusBoard {
    fn notify(&self, title: &str, message: &str) {
        info!(%title, %message, "notification");
        let mut board = self.board();
        if board.notices.len() == MAX_NOTICES {
            board.notices.pop_front();
        }
        board.notices.push_back(Notice {
            title: title.to_owned(),
            message: message.to_owned(),
            at: Local::now(),
        });
    }
}
