//! Topic names shared with the upstream import stages.

pub const UPDATE_NOMINATIVE_USER_REQUEST: &str = "update_nominative_user_request";
pub const UPDATE_NOMINATIVE_USER_REQUEST_RETRY: &str = "update_nominative_user_request_retry";

pub const PROCESS_NOM_POSTGRES_SUCCESS: &str = "process_nom_postgres_success";
pub const PROCESS_NOM_POSTGRES_SUCCESS_RETRY: &str = "process_nom_postgres_success_retry";

pub const PROCESS_NOM_DGRAPH_SUCCESS: &str = "process_nom_dgraph_success";
pub const PROCESS_NOM_DGRAPH_SUCCESS_RETRY: &str = "process_nom_dgraph_success_retry";

pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";
pub const EMAIL_NOTIFICATION: &str = "email_notification";
