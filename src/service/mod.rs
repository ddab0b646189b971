pub mod chat_service;
pub mod itinerary_extractor;
pub mod orchestrator;
pub mod stream_accumulator;
