//! Application-initiated filesystem mutation.

mod facility;

pub use facility::{IoFacility, IoFacilityError};
