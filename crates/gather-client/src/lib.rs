pub mod adapters;
pub mod fetcher;
pub mod llm;

pub use adapters::AdapterSet;
pub use fetcher::ReqwestFetcher;
pub use llm::OpenAiEventSearch;
