//! Request encoding and per-request response tracking.
//!
//! An [`Exchange`] is started when the queue head is sent and is fed every
//! backend message that belongs to it. It reports [`Step::Done`] on the
//! `ReadyForQuery` that closes the request. An `Err` from [`Exchange::step`]
//! means the connection can no longer be trusted.

use crate::config::{ConnectOptions, DecoderHook};
use crate::statement::Statement;
use bytes::BytesMut;
use datacave_core::{
    rows_affected_from_tag, Column, DataRow, DataValue, DatacaveError, QueryResult, Result,
};
use datacave_protocol::frontend::encode_message;
use datacave_protocol::messages::{CloseTarget, DescribeTarget, RowDescriptionField};
use datacave_protocol::{BackendMessage, FrontendMessage};

const TEXT_FORMAT: i16 = 0;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    /// Handshake pseudo-command queued ahead of everything else.
    Startup,
    /// Ad hoc statement; parameters are bound through the unnamed statement.
    Query { sql: String, params: Vec<DataValue> },
    Prepare { name: String, sql: String, param_types: Vec<i32> },
    Execute { statement: String, params: Vec<DataValue> },
    CloseStatement { name: String },
}

impl Request {
    pub(crate) fn describe(&self) -> String {
        match self {
            Request::Startup => "startup".into(),
            Request::Query { sql, params } if params.is_empty() => format!("query {sql:?}"),
            Request::Query { sql, params } => format!("query {sql:?} with {} params", params.len()),
            Request::Prepare { name, .. } => format!("prepare {name}"),
            Request::Execute { statement, .. } => format!("execute {statement}"),
            Request::CloseStatement { name } => format!("close {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Connected,
    Rows(QueryResult),
    Prepared(Statement),
    Closed,
}

#[derive(Debug)]
pub(crate) enum Step {
    Pending,
    Write(BytesMut),
    Done(Result<Reply>),
}

#[derive(Debug)]
enum Kind {
    Startup {
        password: Option<String>,
        authenticated: bool,
    },
    Rows,
    Prepare {
        name: String,
        sql: String,
        param_types: Vec<i32>,
    },
    Close,
}

#[derive(Debug)]
pub(crate) struct Exchange {
    kind: Kind,
    decoder: DecoderHook,
    columns: Vec<Column>,
    rows: Vec<DataRow>,
    tag: String,
    statement_done: bool,
    /// First non-fatal failure; reported once the server is ready again.
    failure: Option<DatacaveError>,
}

impl Exchange {
    /// Encode `request` and create the exchange that will consume its response.
    pub(crate) fn start(request: &Request, options: &ConnectOptions) -> (Self, BytesMut) {
        let mut buf = BytesMut::new();
        let kind = match request {
            Request::Startup => {
                encode_message(
                    &mut buf,
                    &FrontendMessage::Startup {
                        params: options.startup_params(),
                    },
                );
                Kind::Startup {
                    password: options.password.clone(),
                    authenticated: false,
                }
            }
            Request::Query { sql, params } if params.is_empty() => {
                encode_message(&mut buf, &FrontendMessage::Query { sql: sql.clone() });
                Kind::Rows
            }
            Request::Query { sql, params } => {
                encode_message(
                    &mut buf,
                    &FrontendMessage::Parse {
                        statement_name: String::new(),
                        query: sql.clone(),
                        param_oids: params.iter().map(DataValue::type_oid).collect(),
                    },
                );
                encode_portal(&mut buf, "", params);
                Kind::Rows
            }
            Request::Execute { statement, params } => {
                encode_portal(&mut buf, statement, params);
                Kind::Rows
            }
            Request::Prepare {
                name,
                sql,
                param_types,
            } => {
                encode_message(
                    &mut buf,
                    &FrontendMessage::Parse {
                        statement_name: name.clone(),
                        query: sql.clone(),
                        param_oids: param_types.clone(),
                    },
                );
                encode_message(
                    &mut buf,
                    &FrontendMessage::Describe {
                        target: DescribeTarget::Statement,
                        name: name.clone(),
                    },
                );
                encode_message(&mut buf, &FrontendMessage::Sync);
                Kind::Prepare {
                    name: name.clone(),
                    sql: sql.clone(),
                    param_types: param_types.clone(),
                }
            }
            Request::CloseStatement { name } => {
                encode_message(
                    &mut buf,
                    &FrontendMessage::Close {
                        target: CloseTarget::Statement,
                        name: name.clone(),
                    },
                );
                encode_message(&mut buf, &FrontendMessage::Sync);
                Kind::Close
            }
        };
        let exchange = Self {
            kind,
            decoder: options.decoder.clone(),
            columns: Vec::new(),
            rows: Vec::new(),
            tag: String::new(),
            statement_done: false,
            failure: None,
        };
        (exchange, buf)
    }

    pub(crate) fn is_startup(&self) -> bool {
        matches!(self.kind, Kind::Startup { .. })
    }

    pub(crate) fn step(&mut self, msg: BackendMessage) -> Result<Step> {
        if let Kind::Startup {
            password,
            authenticated,
        } = &mut self.kind
        {
            return startup_step(password, authenticated, msg);
        }
        match msg {
            BackendMessage::ErrorResponse(err) => {
                let err = DatacaveError::Server(err);
                if err.is_fatal() {
                    return Err(err);
                }
                // Reported once ReadyForQuery ends the exchange.
                self.fail(err);
                Ok(Step::Pending)
            }
            BackendMessage::ReadyForQuery { .. } => Ok(Step::Done(self.finish())),
            msg => {
                self.collect(msg)?;
                Ok(Step::Pending)
            }
        }
    }

    fn collect(&mut self, msg: BackendMessage) -> Result<()> {
        let rows = matches!(self.kind, Kind::Rows);
        let prepare = matches!(self.kind, Kind::Prepare { .. });
        match msg {
            BackendMessage::ParseComplete if rows || prepare => {}
            BackendMessage::BindComplete | BackendMessage::PortalSuspended if rows => {}
            BackendMessage::CloseComplete if matches!(self.kind, Kind::Close) => {}
            BackendMessage::RowDescription { fields } if rows || prepare => {
                if rows {
                    self.begin_statement();
                }
                self.columns = to_columns(fields);
            }
            BackendMessage::NoData if rows || prepare => {
                if rows {
                    self.begin_statement();
                }
                self.columns.clear();
            }
            BackendMessage::DataRow { values } if rows => {
                if values.len() != self.columns.len() {
                    return Err(DatacaveError::protocol(format!(
                        "data row has {} values for {} columns",
                        values.len(),
                        self.columns.len()
                    )));
                }
                match self.decode_row(values) {
                    Ok(row) => self.rows.push(row),
                    Err(err) => self.fail(err),
                }
            }
            BackendMessage::CommandComplete { tag } if rows => {
                self.begin_statement();
                self.tag = tag;
                self.statement_done = true;
            }
            BackendMessage::EmptyQueryResponse if rows => {
                self.begin_statement();
                self.statement_done = true;
            }
            BackendMessage::ParameterDescription { type_oids } if prepare => {
                if let Kind::Prepare { param_types, .. } = &mut self.kind {
                    *param_types = type_oids;
                }
            }
            msg => {
                return Err(DatacaveError::protocol(format!(
                    "unexpected {} while awaiting {}",
                    msg.name(),
                    kind_name(&self.kind)
                )))
            }
        }
        Ok(())
    }

    /// Drop the previous statement's output once a multi-statement query moves on.
    fn begin_statement(&mut self) {
        if self.statement_done {
            self.columns.clear();
            self.rows.clear();
            self.tag.clear();
            self.statement_done = false;
        }
    }

    fn decode_row(&self, values: Vec<Option<Vec<u8>>>) -> Result<DataRow> {
        let values = values
            .into_iter()
            .zip(&self.columns)
            .map(|(value, column)| match value {
                Some(raw) => self.decoder.0.decode(column, &raw),
                None => Ok(DataValue::Null),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DataRow { values })
    }

    fn fail(&mut self, err: DatacaveError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    fn finish(&mut self) -> Result<Reply> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        let columns = std::mem::take(&mut self.columns);
        match &mut self.kind {
            Kind::Startup { .. } => Ok(Reply::Connected),
            Kind::Rows => {
                let tag = std::mem::take(&mut self.tag);
                Ok(Reply::Rows(QueryResult {
                    columns,
                    rows: std::mem::take(&mut self.rows),
                    rows_affected: rows_affected_from_tag(&tag),
                    tag,
                }))
            }
            Kind::Prepare {
                name,
                sql,
                param_types,
            } => Ok(Reply::Prepared(Statement {
                name: std::mem::take(name),
                sql: std::mem::take(sql),
                param_types: std::mem::take(param_types),
                columns,
            })),
            Kind::Close => Ok(Reply::Closed),
        }
    }
}

fn startup_step(
    password: &mut Option<String>,
    authenticated: &mut bool,
    msg: BackendMessage,
) -> Result<Step> {
    match msg {
        BackendMessage::AuthenticationOk => {
            *authenticated = true;
            Ok(Step::Pending)
        }
        BackendMessage::AuthenticationCleartextPassword => {
            let password = password.take().ok_or_else(|| {
                DatacaveError::Config("server requested a password but none is configured".into())
            })?;
            let mut buf = BytesMut::new();
            encode_message(&mut buf, &FrontendMessage::Password { password });
            Ok(Step::Write(buf))
        }
        BackendMessage::AuthenticationMd5Password { .. }
        | BackendMessage::AuthenticationSasl { .. }
        | BackendMessage::AuthenticationOther { .. } => Err(DatacaveError::protocol(format!(
            "unsupported authentication method {}",
            msg.name()
        ))),
        BackendMessage::ErrorResponse(err) => Err(DatacaveError::Server(err)),
        BackendMessage::ReadyForQuery { .. } if *authenticated => Ok(Step::Done(Ok(Reply::Connected))),
        msg => Err(DatacaveError::protocol(format!(
            "unexpected {} during startup",
            msg.name()
        ))),
    }
}

fn encode_portal(buf: &mut BytesMut, statement: &str, params: &[DataValue]) {
    let param_format_codes = if params.is_empty() {
        Vec::new()
    } else {
        vec![TEXT_FORMAT]
    };
    encode_message(
        buf,
        &FrontendMessage::Bind {
            portal_name: String::new(),
            statement_name: statement.to_string(),
            param_format_codes,
            param_values: params.iter().map(DataValue::to_text).collect(),
            result_format_codes: Vec::new(),
        },
    );
    encode_message(
        buf,
        &FrontendMessage::Describe {
            target: DescribeTarget::Portal,
            name: String::new(),
        },
    );
    encode_message(
        buf,
        &FrontendMessage::Execute {
            portal_name: String::new(),
            max_rows: 0,
        },
    );
    encode_message(buf, &FrontendMessage::Sync);
}

fn to_columns(fields: Vec<RowDescriptionField>) -> Vec<Column> {
    fields
        .into_iter()
        .map(|field| Column::new(field.name, field.type_oid))
        .collect()
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Startup { .. } => "startup",
        Kind::Rows => "query results",
        Kind::Prepare { .. } => "statement description",
        Kind::Close => "close completion",
    }
}
