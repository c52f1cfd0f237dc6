pub mod builder;
pub mod handler;
pub mod rewrite;

pub use builder::ServerBuilder;
pub use handler::RequestHandler;
pub use rewrite::{VersionRewrite, VersionRewriteLayer};
