pub mod aws;
pub mod azure;
pub mod cli;
pub mod docker;
pub mod enrich;
pub mod modules;
pub mod options;
pub mod payload;
pub mod pipeline;
pub mod provider;
pub mod report;
pub mod resource;
pub mod scanner;
pub mod templates;
pub mod util;
