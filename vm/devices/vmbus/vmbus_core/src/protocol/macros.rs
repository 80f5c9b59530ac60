// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Builds the control message catalog from one table: the `MessageType` open
/// enum, the parsed `Message` enum and its parser, and a `VmbusMessage` impl
/// per message struct.
///
/// Each row is `number NAME => Struct [if gate], ... ;`. A row with several
/// structs lists them newest first; the parser takes the first whose gate
/// holds, and a struct without a gate always matches. Gates are expressions
/// over the `ParseContext` bound to the name between the bars.
macro_rules! vmbus_messages {
    (
        pub enum $enum_name:ident, $type_enum:ident |$cx:ident| {
            $( $num:literal $name:ident => $( $type:ident $(if $gate:expr)? ),+ ; )*
        }
    ) => {
        open_enum! {
            /// The tag at the start of every control message.
            #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
            pub enum $type_enum: u32 {
                $( $name = $num, )*
            }
        }

        /// A parsed control message, with whatever bytes follow its struct.
        #[derive(Debug, PartialEq, Eq)]
        pub enum $enum_name<'a> {
            $( $( $type($type, &'a [u8]), )+ )*
        }

        impl<'a> $enum_name<'a> {
            fn parse_unchecked(
                data: &'a [u8],
                version: Option<VersionInfo>,
            ) -> Result<Self, ParseError> {
                let (header, body) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;
                let typ = header.message_type();
                let $cx = ParseContext::new(version, body);
                $(
                    if typ == $type_enum::$name {
                        $(
                            if vmbus_messages!(@gate $($gate)?) {
                                let (message, rest) = decode_body::<$type>(typ, body)?;
                                return Ok(Self::$type(message, rest));
                            }
                        )+
                    }
                )*
                Err(ParseError::InvalidMessageType(typ))
            }

            pub fn message_type(&self) -> $type_enum {
                match self {
                    $( $( Self::$type(..) => $type_enum::$name, )+ )*
                }
            }
        }

        $($(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: $type_enum = $type_enum::$name;
            }

            static_assertions::const_assert!(<$type as VmbusMessage>::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )+)*
    };

    (@gate) => { true };
    (@gate $gate:expr) => { $gate };
}
