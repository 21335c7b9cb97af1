// Copyright 2023-present The Strom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // transient errors, callers retry on the next tick
    #[error("ignored: channel full")]
    Ignore,

    #[error("request canceled")]
    Canceled,

    #[error("deadline exceeded {0}")]
    DeadlineExceeded(String),

    #[error("closed")]
    Closed,

    // permanent errors
    #[error("{0} not exist")]
    NotExist(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("not empty")]
    NotEmpty,

    #[error("not member")]
    NotMember,

    // state-conditional
    #[error("trimmed")]
    Trimmed,

    // internal errors
    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("internal {0}")]
    Internal(String),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("transport {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc {0}")]
    Rpc(tonic::Status),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Transient errors are retried by periodic loops without logging noise.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Ignore | Error::Canceled | Error::DeadlineExceeded(_) | Error::Closed
        )
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        match status.code() {
            Code::NotFound => Error::NotExist(status.message().to_owned()),
            Code::AlreadyExists => Error::AlreadyExists(status.message().to_owned()),
            Code::InvalidArgument => Error::InvalidArgument(status.message().to_owned()),
            Code::Cancelled => Error::Canceled,
            Code::DeadlineExceeded => Error::DeadlineExceeded(status.message().to_owned()),
            Code::Unavailable if status.message() == "closed" => Error::Closed,
            _ => Error::Rpc(status),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        use tonic::Status;

        match err {
            Error::Ignore => Status::unavailable("ignore"),
            err @ Error::NotExist(_) => Status::not_found(err.to_string()),
            err @ Error::AlreadyExists(_) => Status::already_exists(err.to_string()),
            Error::InvalidArgument(msg) => Status::invalid_argument(msg),
            Error::NotEmpty => Status::failed_precondition("not empty"),
            Error::NotMember => Status::failed_precondition("not member"),
            Error::Trimmed => Status::out_of_range("trimmed"),
            Error::Canceled => Status::cancelled("canceled"),
            Error::DeadlineExceeded(msg) => Status::deadline_exceeded(msg),
            Error::Closed => Status::unavailable("closed"),
            Error::Rpc(status) => status,
            err @ (Error::InvalidData(_)
            | Error::Internal(_)
            | Error::Io(_)
            | Error::Transport(_)) => Status::internal(err.to_string()),
        }
    }
}
