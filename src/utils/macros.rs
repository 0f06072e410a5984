/// 生成带调试日志的 getter/setter，用于频率策略上的可变字段
#[macro_export]
macro_rules! getter_setter {
    ($field:ident: $type:ty, $debug_msg:literal) => {
        paste::paste! {
            pub fn [<get_ $field>](&self) -> $type {
                self.$field
            }

            pub fn [<set_ $field>](&mut self, $field: $type) {
                self.$field = $field;
                log::debug!($debug_msg, self.id, $field);
            }
        }
    };
}

/// 生成只读 getter
#[macro_export]
macro_rules! simple_getter {
    ($($field:ident: $type:ty),+ $(,)?) => {
        paste::paste! {
            $(
                pub fn [<get_ $field>](&self) -> $type {
                    self.$field
                }
            )+
        }
    };
}
