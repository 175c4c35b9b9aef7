//! Persistence gateways: the document store (C9, MongoDB) and the
//! time-series store (C10, QuestDB over the Postgres wire protocol).

pub mod documents;
pub mod timeseries;
