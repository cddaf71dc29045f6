//! Operator notifications for unusually large clock adjustments.

use chrono::{DateTime, Utc};
use log::warn;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::config::TrackerConfig;

const MAIL_PROGRAM: &str = "/usr/lib/sendmail";

pub struct ChangeNotifier {
    do_log: bool,
    log_threshold: f64,
    do_mail: bool,
    mail_threshold: f64,
    mail_user: Option<String>,
}

impl ChangeNotifier {
    pub fn new(cfg: &TrackerConfig) -> Self {
        ChangeNotifier {
            do_log: cfg.do_log_change,
            // Thresholds compare against a magnitude.
            log_threshold: cfg.log_change_threshold.abs(),
            do_mail: cfg.do_mail_change,
            mail_threshold: cfg.mail_change_threshold.abs(),
            mail_user: cfg.mail_change_user.clone(),
        }
    }

    /// Called once per accepted measurement with the adjustment about to be
    /// applied.
    pub fn offset_update(&self, now: &DateTime<Utc>, offset: f64) {
        if self.do_log && offset.abs() > self.log_threshold {
            warn!(
                "System clock wrong by {:.6} seconds, adjustment started",
                -offset
            );
        }
        if self.do_mail && offset.abs() > self.mail_threshold {
            if let Some(user) = &self.mail_user {
                self.send_mail(user, now, offset);
            }
        }
    }

    fn send_mail(&self, user: &str, now: &DateTime<Utc>, offset: f64) {
        let host = hostname();
        let body = format_mail(&host, user, now, offset, self.mail_threshold);

        let child = Command::new(MAIL_PROGRAM)
            .arg(user)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not run {}: {}", MAIL_PROGRAM, e);
                return;
            }
        };
        if let Some(stdin) = child.stdin.as_mut() {
            if let Err(e) = stdin.write_all(body.as_bytes()) {
                warn!("Could not send mail notification: {}", e);
            }
        }
        drop(child.stdin.take());
        let _ = child.wait();
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    "localhost".to_string()
}

fn format_mail(host: &str, user: &str, now: &DateTime<Utc>, offset: f64, threshold: f64) -> String {
    format!(
        "To: {}\nSubject: Change to system clock on node [{}]\n\n\
         On {}\n  with the system clock reading {}\n\
         an adjustment of {:.6} seconds was started, exceeding the reporting \
         threshold of {:.6} seconds\n",
        user,
        host,
        now.format("%A, %d %B %Y"),
        now.format("%H:%M:%S (UTC)"),
        -offset,
        threshold,
    )
}
