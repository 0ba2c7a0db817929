use std::path::{Path, PathBuf};

use crate::wire::{ClientStartRequest, Protocol, SessionKey};

use super::SessionParams;

const DEFAULT_INTERVAL: &str = "1";

/// Native argument list for one session.
pub(crate) fn generator_args(params: &SessionParams) -> Vec<String> {
    match params {
        SessionParams::Server { port, bind } => server_args(*port, bind.as_deref()),
        SessionParams::Client(request) => client_args(request),
    }
}

pub(crate) fn server_args(port: u16, bind: Option<&str>) -> Vec<String> {
    let mut args = vec!["-s".to_owned(), "-p".to_owned(), port.to_string()];
    if let Some(bind) = bind.filter(|value| !value.is_empty()) {
        args.push("-B".to_owned());
        args.push(bind.to_owned());
    }
    args.push("-i".to_owned());
    args.push(DEFAULT_INTERVAL.to_owned());
    args.push("--forceflush".to_owned());
    args
}

pub(crate) fn client_args(request: &ClientStartRequest) -> Vec<String> {
    let interval = request
        .interval
        .as_deref()
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_INTERVAL);
    let mut args = vec![
        "-c".to_owned(),
        request.target.clone(),
        "-p".to_owned(),
        request.port.to_string(),
        "-i".to_owned(),
        interval.to_owned(),
        "--forceflush".to_owned(),
    ];
    if request.proto == Protocol::Udp {
        args.push("-u".to_owned());
    }
    if request.bidir {
        args.push("--bidir".to_owned());
    } else if request.reverse {
        args.push("-R".to_owned());
    }
    if let Some(duration) = request.duration {
        args.push("-t".to_owned());
        args.push(duration.to_string());
    }
    if let Some(omit) = request.omit {
        args.push("-O".to_owned());
        args.push(omit.to_string());
    }
    if request.parallel > 1 {
        args.push("-P".to_owned());
        args.push(request.parallel.to_string());
    }
    push_optional(&mut args, "-b", request.bitrate.as_deref());
    push_optional(&mut args, "-l", request.length.as_deref());
    push_optional(&mut args, "-w", request.window.as_deref());
    push_optional(&mut args, "-B", request.bind.as_deref());
    args
}

fn push_optional(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) {
        args.push(flag.to_owned());
        args.push(value.to_owned());
    }
}

/// Per-session raw output file, e.g. `client_10.0.0.1_5211_20240101_120000.log`.
pub(crate) fn log_file_path(log_dir: &Path, params: &SessionParams, stamp: &str) -> PathBuf {
    let name = match params {
        SessionParams::Server { port, .. } => format!("server_{}_{}.log", port, stamp),
        SessionParams::Client(request) => format!(
            "client_{}_{}_{}.log",
            sanitize(&request.target),
            request.port,
            stamp
        ),
    };
    log_dir.join(name)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

impl SessionParams {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        match self {
            Self::Server { port, .. } => SessionKey::server(*port),
            Self::Client(request) => SessionKey::client(request.port),
        }
    }

    pub(crate) const fn reverse(&self) -> bool {
        match self {
            Self::Server { .. } => false,
            Self::Client(request) => request.reverse && !request.bidir,
        }
    }

    pub(crate) const fn parallel(&self) -> u32 {
        match self {
            Self::Server { .. } => 1,
            Self::Client(request) => request.parallel,
        }
    }
}
