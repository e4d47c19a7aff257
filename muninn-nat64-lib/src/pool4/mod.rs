mod db;
mod mask;

pub use db::{Pool4Db, Pool4Sample};
pub use mask::MaskDomain;
