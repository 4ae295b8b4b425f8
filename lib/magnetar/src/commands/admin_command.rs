//! User and role management over the compact admin framing: proto type 2,
//! a 16-byte admin header, then `[len:u32, id:u8, data]` fields. Runs
//! directly on a connection; the caller owns pooling and timeouts.

use crate::commands::buffer;
use crate::commands::buffer::Buffer;
use crate::errors::{Error, Result};
use crate::net::Connection;
use crate::result_code::ResultCode;
use crate::user::{AdminUser, Privilege, PrivilegeCode, Role};
use pwhash::bcrypt::{self, BcryptSetup, BcryptVariant};

const AUTHENTICATE: u8 = 0;
const CREATE_USER: u8 = 1;
const DROP_USER: u8 = 2;
const SET_PASSWORD: u8 = 3;
const CHANGE_PASSWORD: u8 = 4;
const GRANT_ROLES: u8 = 5;
const REVOKE_ROLES: u8 = 6;
const REPLACE_ROLES: u8 = 7;
const CREATE_ROLE: u8 = 8;
const QUERY_USERS: u8 = 9;
const QUERY_ROLES: u8 = 10;

const FIELD_USER: u8 = 0;
const FIELD_PASSWORD: u8 = 1;
const FIELD_OLD_PASSWORD: u8 = 2;
const FIELD_CREDENTIAL: u8 = 3;
const FIELD_ROLES: u8 = 10;
const FIELD_PRIVILEGES: u8 = 11;

// Fixed salt mandated by the wire protocol; the server compares full
// bcrypt strings, so every client must hash identically.
const BCRYPT_SALT: &str = "7EqJtq98hPqEX7fNZaFWoO";

/// Bcrypt credential for a clear-text password, as sent in the
/// CREDENTIAL/PASSWORD fields.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash_with(
        BcryptSetup {
            salt: Some(BCRYPT_SALT),
            variant: Some(BcryptVariant::V2a),
            cost: Some(10),
        },
        password,
    )
    .map_err(|err| Error::invalid_argument(format!("password hashing failed: {}", err)))
}

fn begin(buffer: &mut Buffer, command: u8, field_count: u8) {
    buffer.data_buffer.clear();
    buffer.data_offset = 8;
    buffer.write_u8(0);
    buffer.write_u8(0);
    buffer.write_u8(command);
    buffer.write_u8(field_count);
    buffer.write_bytes(&[0u8; 12]);
}

fn write_field_str(buffer: &mut Buffer, id: u8, value: &str) {
    buffer.write_u32(value.len() as u32 + 1);
    buffer.write_u8(id);
    buffer.write_str(value);
}

fn write_roles(buffer: &mut Buffer, roles: &[String]) {
    let size: usize = 1 + roles.iter().map(|role| 1 + role.len()).sum::<usize>();
    buffer.write_u32(size as u32 + 1);
    buffer.write_u8(FIELD_ROLES);
    buffer.write_u8(roles.len() as u8);
    for role in roles {
        buffer.write_u8(role.len() as u8);
        buffer.write_str(role);
    }
}

fn write_privileges(buffer: &mut Buffer, privileges: &[Privilege]) {
    let size: usize = 1
        + privileges
            .iter()
            .map(|p| 1 + 1 + p.namespace.len() + 1 + p.set_name.len())
            .sum::<usize>();
    buffer.write_u32(size as u32 + 1);
    buffer.write_u8(FIELD_PRIVILEGES);
    buffer.write_u8(privileges.len() as u8);
    for privilege in privileges {
        buffer.write_u8(privilege.code as u8);
        buffer.write_u8(privilege.namespace.len() as u8);
        buffer.write_str(&privilege.namespace);
        buffer.write_u8(privilege.set_name.len() as u8);
        buffer.write_str(&privilege.set_name);
    }
}

/// Send the built admin frame and check the single-status response.
fn execute(conn: &mut Connection) -> Result<()> {
    conn.buffer.end(buffer::PROTO_TYPE_ADMIN);
    conn.flush()?;

    let size = conn.read_message()?;
    if size < 2 {
        return Err(Error::parse("short admin response"));
    }
    match ResultCode::from(conn.buffer.read_u8_at(1)) {
        ResultCode::Ok => Ok(()),
        rc => Err(Error::server(rc)),
    }
}

/// Login handshake run on every fresh connection of a secured cluster.
pub fn authenticate_connection(conn: &mut Connection, user: &str, credential: &str) -> Result<()> {
    begin(&mut conn.buffer, AUTHENTICATE, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_field_str(&mut conn.buffer, FIELD_CREDENTIAL, credential);
    execute(conn)
}

pub fn create_user(
    conn: &mut Connection,
    user: &str,
    password: &str,
    roles: &[String],
) -> Result<()> {
    let credential = hash_password(password)?;
    begin(&mut conn.buffer, CREATE_USER, 3);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_field_str(&mut conn.buffer, FIELD_PASSWORD, &credential);
    write_roles(&mut conn.buffer, roles);
    execute(conn)
}

pub fn drop_user(conn: &mut Connection, user: &str) -> Result<()> {
    begin(&mut conn.buffer, DROP_USER, 1);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    execute(conn)
}

/// Administrative password reset (no proof of the old password).
pub fn set_password(conn: &mut Connection, user: &str, password: &str) -> Result<()> {
    let credential = hash_password(password)?;
    begin(&mut conn.buffer, SET_PASSWORD, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_field_str(&mut conn.buffer, FIELD_PASSWORD, &credential);
    execute(conn)
}

/// Self-service password change carrying the old credential.
pub fn change_password(
    conn: &mut Connection,
    user: &str,
    old_password: &str,
    new_password: &str,
) -> Result<()> {
    let old_credential = hash_password(old_password)?;
    let new_credential = hash_password(new_password)?;
    begin(&mut conn.buffer, CHANGE_PASSWORD, 3);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_field_str(&mut conn.buffer, FIELD_OLD_PASSWORD, &old_credential);
    write_field_str(&mut conn.buffer, FIELD_PASSWORD, &new_credential);
    execute(conn)
}

pub fn grant_roles(conn: &mut Connection, user: &str, roles: &[String]) -> Result<()> {
    begin(&mut conn.buffer, GRANT_ROLES, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_roles(&mut conn.buffer, roles);
    execute(conn)
}

pub fn revoke_roles(conn: &mut Connection, user: &str, roles: &[String]) -> Result<()> {
    begin(&mut conn.buffer, REVOKE_ROLES, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_roles(&mut conn.buffer, roles);
    execute(conn)
}

pub fn replace_roles(conn: &mut Connection, user: &str, roles: &[String]) -> Result<()> {
    begin(&mut conn.buffer, REPLACE_ROLES, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, user);
    write_roles(&mut conn.buffer, roles);
    execute(conn)
}

pub fn create_role(conn: &mut Connection, role: &str, privileges: &[Privilege]) -> Result<()> {
    begin(&mut conn.buffer, CREATE_ROLE, 2);
    write_field_str(&mut conn.buffer, FIELD_USER, role);
    write_privileges(&mut conn.buffer, privileges);
    execute(conn)
}

/// Stream the user list. Frames repeat `[_, status, _, field_count]` plus
/// fields until a record with QUERY_END arrives.
pub fn query_users(conn: &mut Connection) -> Result<Vec<AdminUser>> {
    begin(&mut conn.buffer, QUERY_USERS, 0);
    conn.buffer.end(buffer::PROTO_TYPE_ADMIN);
    conn.flush()?;

    let mut users = Vec::new();
    loop {
        let size = conn.read_message()?;
        while conn.buffer.data_offset < size {
            if size - conn.buffer.data_offset < 4 {
                return Err(Error::parse("truncated admin record"));
            }
            conn.buffer.skip(1);
            let status = ResultCode::from(conn.buffer.read_u8());
            conn.buffer.skip(1);
            let field_count = conn.buffer.read_u8() as usize;

            match status {
                ResultCode::QueryEnd => return Ok(users),
                ResultCode::Ok => (),
                rc => return Err(Error::server(rc)),
            }

            let mut name = String::new();
            let mut roles = Vec::new();
            for _ in 0..field_count {
                let len = conn.buffer.read_u32() as usize;
                if len < 1 || len > conn.buffer.remaining() {
                    return Err(Error::parse(format!("invalid admin field length {}", len)));
                }
                let id = conn.buffer.read_u8();
                match id {
                    FIELD_USER => name = conn.buffer.read_str(len - 1)?,
                    FIELD_ROLES => {
                        let count = conn.buffer.read_u8() as usize;
                        for _ in 0..count {
                            let role_len = conn.buffer.read_u8() as usize;
                            roles.push(conn.buffer.read_str(role_len)?);
                        }
                    }
                    _ => conn.buffer.skip(len - 1),
                }
            }
            users.push(AdminUser { name, roles });
        }
    }
}

/// Stream the role list with per-role privileges.
pub fn query_roles(conn: &mut Connection) -> Result<Vec<Role>> {
    begin(&mut conn.buffer, QUERY_ROLES, 0);
    conn.buffer.end(buffer::PROTO_TYPE_ADMIN);
    conn.flush()?;

    let mut roles = Vec::new();
    loop {
        let size = conn.read_message()?;
        while conn.buffer.data_offset < size {
            if size - conn.buffer.data_offset < 4 {
                return Err(Error::parse("truncated admin record"));
            }
            conn.buffer.skip(1);
            let status = ResultCode::from(conn.buffer.read_u8());
            conn.buffer.skip(1);
            let field_count = conn.buffer.read_u8() as usize;

            match status {
                ResultCode::QueryEnd => return Ok(roles),
                ResultCode::Ok => (),
                rc => return Err(Error::server(rc)),
            }

            let mut name = String::new();
            let mut privileges = Vec::new();
            for _ in 0..field_count {
                let len = conn.buffer.read_u32() as usize;
                if len < 1 || len > conn.buffer.remaining() {
                    return Err(Error::parse(format!("invalid admin field length {}", len)));
                }
                let id = conn.buffer.read_u8();
                match id {
                    FIELD_USER => name = conn.buffer.read_str(len - 1)?,
                    FIELD_PRIVILEGES => {
                        let count = conn.buffer.read_u8() as usize;
                        for _ in 0..count {
                            let code = conn.buffer.read_u8();
                            let code = PrivilegeCode::from_u8(code).ok_or_else(|| {
                                Error::parse(format!("unknown privilege code {}", code))
                            })?;
                            let ns_len = conn.buffer.read_u8() as usize;
                            let namespace = conn.buffer.read_str(ns_len)?;
                            let set_len = conn.buffer.read_u8() as usize;
                            let set_name = conn.buffer.read_str(set_len)?;
                            privileges.push(Privilege {
                                code,
                                namespace,
                                set_name,
                            });
                        }
                    }
                    _ => conn.buffer.skip(len - 1),
                }
            }
            roles.push(Role { name, privileges });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_uses_protocol_salt() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$2a$10$7EqJtq98hPqEX7fNZaFWoO"));
        assert_eq!(hash.len(), 60);
        // Deterministic: same password, same credential.
        assert_eq!(hash, hash_password("hunter2").unwrap());
        assert_ne!(hash, hash_password("hunter3").unwrap());
    }

    #[test]
    fn test_admin_frame_layout() {
        let mut buffer = Buffer::new();
        begin(&mut buffer, CREATE_USER, 3);
        write_field_str(&mut buffer, FIELD_USER, "alice");
        write_roles(&mut buffer, &["ops".to_string(), "dev".to_string()]);
        buffer.end(buffer::PROTO_TYPE_ADMIN);

        let frame = buffer.frame();
        assert_eq!(frame[0], 2); // proto version
        assert_eq!(frame[1], 2); // admin type
        assert_eq!(frame[10], CREATE_USER);
        assert_eq!(frame[11], 3);
        // First field starts after the 16-byte admin header.
        assert_eq!(frame[28], FIELD_USER);
        assert_eq!(&frame[29..34], b"alice");
        // Roles field: count then length-prefixed names.
        assert_eq!(frame[38], FIELD_ROLES);
        assert_eq!(frame[39], 2);
        assert_eq!(frame[40], 3);
        assert_eq!(&frame[41..44], b"ops");
    }
}
