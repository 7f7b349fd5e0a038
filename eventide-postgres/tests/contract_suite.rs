//! Runs the shared event log contract against PostgreSQL.

mod common;

use eventide::testing::contract::ContractEvent;
use eventide_postgres::PostgresEventLog;

fn make_log() -> PostgresEventLog<ContractEvent> {
    common::event_log()
}

eventide::event_log_contract_tests! {
    #[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
    suite = postgres,
    make_log = make_log,
}
