use tokio::net::{UnixStream, unix::OwnedWriteHalf};
use tokio::io::AsyncWriteExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc::{self, Receiver, Sender};

use std::path::Path;
use serde::{Serialize,Deserialize};
use std::process;
use log::{debug,error};
use crate::util::error::DynResult;

/// Client side of an Open Pipe connection to the HMI runtime
pub struct Connection
{
    stream: OwnedWriteHalf,
    cookie_prefix: String,
    cookie_count: u32,
    replies: Receiver<Message>
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all="PascalCase")]
pub struct ErrorInfo
{
    pub error_code: u32,
    pub error_description: String
}

impl std::error::Error for ErrorInfo {}

impl std::fmt::Display for ErrorInfo
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{} (0x{:08x})", self.error_description, self.error_code)
    }
}

impl Default for ErrorInfo
{
    fn default() -> ErrorInfo
    {
	ErrorInfo{error_code: 0,
		  error_description: String::new()
	}
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all="PascalCase")]
pub struct ReadTagParams
{
    pub tags: Vec<String>
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all="PascalCase")]
pub struct TagData
{
    pub name: String,
    pub value: String,
    pub quality: String,
    pub quality_code: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all="PascalCase")]
pub struct NotifyTag
{
    #[serde(flatten)]
    pub data: TagData,

    pub time_stamp: String,

    #[serde(flatten)]
    pub error: ErrorInfo
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all="PascalCase")]
pub struct NotifyTags
{
    pub tags: Vec<NotifyTag>,
}

// Serialize as 'Params: {...}'
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all="PascalCase")]
pub struct ParamWrapperCap<T> {
    pub params: T
}

impl<T> From<T> for ParamWrapperCap<T>
{
    fn from(v: T) -> Self
    {
	ParamWrapperCap{params: v}
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag="Message")]
pub enum MessageVariant
{
    ReadTag(ParamWrapperCap<ReadTagParams>),
    NotifyReadTag(ParamWrapperCap<NotifyTags>),
    ErrorReadTag(ErrorInfo),
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all="PascalCase")]
pub struct Message
{
    #[serde(flatten)]
    pub message: MessageVariant,
    pub client_cookie: String,
}

async fn read_connection<R>(r: R, send: Sender<Message>)
    where R: AsyncRead + Unpin
{
    let mut r = BufReader::new(r);
    loop {
        let mut line = String::new();
        match r.read_line(&mut line).await {
            Err(e) => {
                error!("Failed to read line from pipe: {}", e);
                break;
            },
            Ok(l) => {
                if l == 0 {
                    break;
                }
                debug!("Got line: {}",line);
                match serde_json::from_str(&line) {
                    // Other runtime notifications end up here too
                    Err(e) => {
                        debug!("Ignoring message: {}", e);
                    },
                    Ok(msg) => {
                        if send.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Pipe reader exited");
}

async fn send_cmd(stream: &mut OwnedWriteHalf, cmd: &Message) -> DynResult<()>
{
    let mut cmd_bytes = serde_json::to_vec(cmd)?;
    cmd_bytes.push(b'\n');
    debug!("Cmd: {}", String::from_utf8_lossy(&cmd_bytes));
    stream.write_all(&cmd_bytes).await?;
    stream.flush().await?;
    Ok(())
}

impl Connection {
    pub async fn connect<P>(path: P) -> std::io::Result<Connection>
    where P: AsRef<Path>
    {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Connection
    {
	let (r,w) = stream.into_split();
        let (msg_in, msg_out) = mpsc::channel(10);
        tokio::spawn(read_connection(r, msg_in));
        Connection {
	    stream: w,
	    cookie_prefix: format!("alarm_{}_", process::id()),
	    cookie_count: 0,
	    replies: msg_out
        }
    }

    fn get_cookie(&mut self) -> String
    {
        self.cookie_count = self.cookie_count.wrapping_add(1);
        self.cookie_prefix.clone()+&self.cookie_count.to_string()
    }

    /// Next message from the runtime, `None` when the pipe is closed
    pub async fn get_message(&mut self) -> Option<Message> {
        self.replies.recv().await
    }

    /// Request the current values of some tags. Returns the cookie the
    /// reply will carry.
    pub async fn read_tags(&mut self, tags: &[&str]) -> DynResult<String>
    {
        let cmd = Message {
            message: MessageVariant::ReadTag(ParamWrapperCap{
                params: ReadTagParams {
                    tags: tags.iter().map(|t| String::from(*t)).collect(),
                }}),
            client_cookie: self.get_cookie()
        };
        send_cmd(&mut self.stream, &cmd).await?;
        Ok(cmd.client_cookie)
    }
}

#[test]
fn serialize_test()
{
    let request = Message{
        message: MessageVariant::ReadTag(ParamWrapperCap {
            params: ReadTagParams {
                tags: vec!["AlarmWord_0".to_string()]
            }}),
        client_cookie: "alarm_1_1".to_string()
    };
    assert_eq!(serde_json::to_string(&request).unwrap(),
	       r#"{"Message":"ReadTag","Params":{"Tags":["AlarmWord_0"]},"ClientCookie":"alarm_1_1"}"#);
}

#[test]
fn deserialize_test()
{
    let reply = r#"{"Message":"NotifyReadTag","Params":{"Tags":[{"Name":"AlarmWord_3","Value":"4096","Quality":"Good","QualityCode":192,"TimeStamp":"2021-03-23T11:23:11Z","ErrorCode":0,"ErrorDescription":""}]},"ClientCookie":"alarm_1_7"}"#;
    let msg: Message = serde_json::from_str(reply).unwrap();
    assert_eq!(msg.client_cookie, "alarm_1_7");
    match msg.message {
	MessageVariant::NotifyReadTag(notify) => {
	    let tag = &notify.params.tags[0];
	    assert_eq!(tag.data.name, "AlarmWord_3");
	    assert_eq!(tag.data.value, "4096");
	    assert_eq!(tag.error, ErrorInfo::default());
	},
	other => panic!("Unexpected message: {:?}", other)
    }

    let error = r#"{"Message":"ErrorReadTag","ErrorCode":5,"ErrorDescription":"Tag not found","ClientCookie":"alarm_1_8"}"#;
    let msg: Message = serde_json::from_str(error).unwrap();
    assert!(matches!(msg.message, MessageVariant::ErrorReadTag(ErrorInfo{error_code: 5, ..})));
}
