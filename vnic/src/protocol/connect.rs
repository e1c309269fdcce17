use super::codec::{WireReader, WireWriter};
use crate::error::Result;

const NODE_NAME_LEN: usize = 65;

/// Size of the encoded connection private data.
pub const CONNECTION_DATA_SIZE: usize = 8 + 1 + 1 + NODE_NAME_LEN + 1 + 4;

/// Private data carried by connection-manager requests for both the control
/// and the data connection of a viport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionData {
    /// Identifies the viport; the controller pairs control and data
    /// connections with it.
    pub path_id: u64,
    pub instance: u8,
    /// 0 for the primary netpath, 1 for the secondary.
    pub path_num: u8,
    pub node_name: String,
    pub features: u32,
}

impl ConnectionData {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(CONNECTION_DATA_SIZE);
        w.u64(self.path_id)
            .u8(self.instance)
            .u8(self.path_num)
            .fixed(self.node_name.as_bytes(), NODE_NAME_LEN)
            .zeros(1)
            .u32(self.features);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf, "connection data");
        let path_id = r.u64()?;
        let instance = r.u8()?;
        let path_num = r.u8()?;
        let node_name = r.text(NODE_NAME_LEN)?;
        r.skip(1)?;
        Ok(ConnectionData {
            path_id,
            instance,
            path_num,
            node_name,
            features: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_data() {
        let cd = ConnectionData {
            path_id: 0xabcd,
            instance: 2,
            path_num: 1,
            node_name: "compute-17".into(),
            features: 0x33,
        };
        let buf = cd.encode();
        assert_eq!(buf.len(), CONNECTION_DATA_SIZE);
        assert_eq!(ConnectionData::decode(&buf).unwrap(), cd);
    }

    #[test]
    fn test_short_private_data() {
        assert!(ConnectionData::decode(&[0u8; 12]).is_err());
    }
}
