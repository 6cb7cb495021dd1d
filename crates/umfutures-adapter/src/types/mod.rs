/*
[INPUT]:  Type submodules
[OUTPUT]: Public type exports
[POS]:    Data layer - module wiring
[UPDATE]: When adding new type modules
*/

pub mod enums;
pub mod models;
pub mod requests;
pub mod responses;

pub use enums::*;
pub use models::*;
pub use requests::*;
pub use responses::*;
