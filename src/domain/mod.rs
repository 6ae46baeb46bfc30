//! Domain entities and OCPP message types

pub mod action;
pub mod charge_point;
pub mod transaction;

pub use action::{
    Action, AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, ChangeConfigurationRequest, HeartbeatResponse, IdTagInfo,
    MeterValue, MeterValuesRequest, RegistrationStatus, RemoteCommandStatus,
    RemoteStartTransactionRequest, RemoteStopTransactionRequest, ResetKind, ResetRequest,
    SampledValue, SecurityEventNotificationRequest, StartTransactionRequest,
    StartTransactionResponse, StatusNotificationRequest, StopTransactionRequest,
    StopTransactionResponse, UnlockConnectorRequest,
};
pub use charge_point::{ChargePointInfo, Connector, ConnectorStatus, OcppVersion};
pub use transaction::{MeterSample, Transaction, TransactionStatus};
