pub mod metabase_service;
