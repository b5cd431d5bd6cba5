mod header;
pub(crate) mod legacy;
mod message;
pub(crate) mod util;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message, MessageFlags},
};
