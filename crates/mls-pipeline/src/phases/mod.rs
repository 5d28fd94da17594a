pub mod crawl;
pub mod css;
pub mod deploy;
pub mod fonts;
pub mod html;
pub mod images;
pub mod js;
pub mod measure;

pub use crawl::CrawlOutput;
