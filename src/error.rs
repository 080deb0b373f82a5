use log::error;
use rocket::http::Status;
use rocket::response::status::Custom;
use std::backtrace::Backtrace;

/// Tagged outcomes of the booking engine. Everything except `Storage` is an
/// expected-path result the caller branches on; `Storage` is the only
/// retryable class.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Class not found.")]
    NotFound,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("You are already booked for this class.")]
    AlreadyBooked,
    #[error("You are already waitlisted for this class.")]
    AlreadyWaitlisted,
    #[error("This class has been canceled.")]
    SessionCanceled,
    #[error("This class has already ended.")]
    SessionEnded,
    #[error("You are not booked or waitlisted for this class.")]
    NotBookedOrWaitlisted,
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl BookingError {
    pub fn http_status(&self) -> Status {
        match self {
            BookingError::InvalidInput(_)
            | BookingError::SessionCanceled
            | BookingError::SessionEnded => Status::BadRequest,
            BookingError::NotFound | BookingError::NotBookedOrWaitlisted => Status::NotFound,
            BookingError::Forbidden(_) => Status::Forbidden,
            BookingError::AlreadyBooked | BookingError::AlreadyWaitlisted => Status::Conflict,
            BookingError::Storage(_) => Status::InternalServerError,
        }
    }
}

pub(crate) fn status_booking_error(err: BookingError) -> Custom<String> {
    if let BookingError::Storage(ref e) = err {
        error!("SQL Error: {e}\nbacktrace: {}", Backtrace::capture());
        return Custom(Status::InternalServerError, "Storage error, please try again.".to_string());
    }
    Custom(err.http_status(), err.to_string())
}
