pub mod io;
pub mod native;
pub mod pattern;
pub mod protection;
pub mod query;
pub mod region;
