pub mod contracts_db;
